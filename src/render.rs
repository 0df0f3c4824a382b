use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::RenderError;

/// Extension of every rendered document, whatever the selection delivers.
pub const DOCX_EXTENSION: &str = "docx";

/// A Word template loaded once and rendered per student. Placeholders are
/// `{tag}` in the document body, headers and footers.
pub struct DocxTemplate {
    path: PathBuf,
    bytes: Vec<u8>,
}

fn is_templated_part(name: &str) -> bool {
    name == "word/document.xml"
        || (name.starts_with("word/header") && name.ends_with(".xml"))
        || (name.starts_with("word/footer") && name.ends_with(".xml"))
}

fn is_tag_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Splits the inside of `{...}` into its visible text and the markup Word
/// interleaved when the tag was split across runs.
fn split_markup(inner: &str) -> (String, String) {
    let mut text = String::new();
    let mut markup = String::new();
    let mut in_tag = false;
    for c in inner.chars() {
        match c {
            '<' => {
                in_tag = true;
                markup.push(c);
            }
            '>' if in_tag => {
                in_tag = false;
                markup.push(c);
            }
            _ if in_tag => markup.push(c),
            _ => text.push(c),
        }
    }
    (text, markup)
}

/// Replaces `{tag}` occurrences in one XML part. Unknown tags render empty.
pub fn substitute(
    part: &str,
    xml: &str,
    fields: &BTreeMap<String, String>,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| RenderError::UnclosedTag {
            part: part.to_string(),
        })?;
        let (text, markup) = split_markup(&after[..close]);
        let name = text.trim();

        if !is_tag_name(name) {
            out.push('{');
            rest = after;
            continue;
        }

        match fields.get(name) {
            Some(value) => out.push_str(&escape_xml(value)),
            None => debug!("tag {{{}}} has no value in {}", name, part),
        }
        out.push_str(&markup);
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

impl DocxTemplate {
    pub fn load(path: &Path) -> Result<Self, RenderError> {
        let bytes = std::fs::read(path).map_err(|source| RenderError::Template {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_bytes(path.to_path_buf(), bytes))
    }

    pub fn from_bytes(path: PathBuf, bytes: Vec<u8>) -> Self {
        Self { path, bytes }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn render(&self, fields: &BTreeMap<String, String>) -> Result<Vec<u8>, RenderError> {
        let mut archive = ZipArchive::new(Cursor::new(self.bytes.as_slice()))?;
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let name = entry.name().to_string();

            if !is_templated_part(&name) {
                writer.raw_copy_file(entry)?;
                continue;
            }

            let mut xml = String::new();
            entry
                .read_to_string(&mut xml)
                .map_err(|_| RenderError::Encoding { part: name.clone() })?;
            let rendered = substitute(&name, &xml, fields)?;
            writer.start_file(name, options)?;
            writer.write_all(rendered.as_bytes())?;
        }

        let cursor = writer.finish()?;
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
pub(crate) fn build_docx(document_xml: &str) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();
    writer.start_file("[Content_Types].xml", options).unwrap();
    writer.write_all(b"<Types/>").unwrap();
    writer.start_file("word/document.xml", options).unwrap();
    writer.write_all(document_xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
pub(crate) fn read_part(docx: &[u8], part: &str) -> String {
    let mut archive = ZipArchive::new(Cursor::new(docx)).unwrap();
    let mut entry = archive.by_name(part).unwrap();
    let mut out = String::new();
    entry.read_to_string(&mut out).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_tags_and_escapes_values() {
        let xml = "<w:t>Kia ora {first_name}, score {crit_one_score}</w:t>";
        let out = substitute(
            "word/document.xml",
            xml,
            &fields(&[("first_name", "Jane & Co"), ("crit_one_score", "32.00")]),
        )
        .unwrap();
        assert_eq!(out, "<w:t>Kia ora Jane &amp; Co, score 32.00</w:t>");
    }

    #[test]
    fn absent_fields_render_empty() {
        let out = substitute("word/document.xml", "<w:t>[{crit_three_score}]</w:t>", &fields(&[])).unwrap();
        assert_eq!(out, "<w:t>[]</w:t>");
    }

    #[test]
    fn split_runs_keep_their_markup() {
        let xml = "<w:t>{first_</w:t></w:r><w:r><w:t>name}</w:t>";
        let out = substitute("word/document.xml", xml, &fields(&[("first_name", "Jane")])).unwrap();
        assert_eq!(out, "<w:t>Jane</w:t></w:r><w:r><w:t></w:t>");
    }

    #[test]
    fn non_tag_braces_pass_through() {
        let xml = "<w:t>{ a + b }</w:t>";
        let out = substitute("word/document.xml", xml, &fields(&[])).unwrap();
        assert_eq!(out, xml);
    }

    #[test]
    fn unclosed_tag_is_an_error() {
        let result = substitute("word/document.xml", "<w:t>{first_name</w:t>", &fields(&[]));
        assert!(matches!(result, Err(RenderError::UnclosedTag { .. })));
    }

    #[test]
    fn renders_document_part_and_copies_the_rest() {
        let template = DocxTemplate::from_bytes(
            PathBuf::from("inline.docx"),
            build_docx("<w:t>{first_name} {last_name}</w:t>"),
        );
        let rendered = template
            .render(&fields(&[("first_name", "Jane"), ("last_name", "Doe")]))
            .unwrap();
        assert_eq!(read_part(&rendered, "word/document.xml"), "<w:t>Jane Doe</w:t>");
        assert_eq!(read_part(&rendered, "[Content_Types].xml"), "<Types/>");
    }

    #[test]
    fn garbage_template_is_an_archive_error() {
        let template = DocxTemplate::from_bytes(PathBuf::from("bad.docx"), b"not a zip".to_vec());
        assert!(matches!(
            template.render(&fields(&[])),
            Err(RenderError::Archive(_))
        ));
    }
}
