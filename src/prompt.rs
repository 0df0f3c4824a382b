use std::io::{self, BufRead, Write};

/// Asks the operator to pick one of `choices` by number or by exact label,
/// asking again until the answer is valid.
pub fn choose<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    message: &str,
    choices: &[String],
) -> io::Result<String> {
    if choices.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no choices available for: {message}"),
        ));
    }

    loop {
        writeln!(output, "{message}")?;
        for (idx, choice) in choices.iter().enumerate() {
            writeln!(output, "  {}) {}", idx + 1, choice)?;
        }
        write!(output, "> ")?;
        output.flush()?;

        let answer = read_line(input)?;
        if let Ok(number) = answer.parse::<usize>() {
            if (1..=choices.len()).contains(&number) {
                return Ok(choices[number - 1].clone());
            }
        }
        if let Some(choice) = choices.iter().find(|c| c.as_str() == answer) {
            return Ok(choice.clone());
        }
        writeln!(output, "`{answer}` is not one of the choices.")?;
    }
}

/// Asks a free-text question and returns the trimmed answer.
pub fn ask<R: BufRead, W: Write>(input: &mut R, output: &mut W, message: &str) -> io::Result<String> {
    write!(output, "{message}")?;
    output.flush()?;
    read_line(input)
}

fn read_line<R: BufRead>(input: &mut R) -> io::Result<String> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "input closed before an answer was given",
        ));
    }
    Ok(line.trim().to_string())
}
