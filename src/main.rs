use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod auth;
mod config;
mod dispatch;
mod error;
mod mailer;
mod merge;
mod models;
mod prompt;
mod render;
mod source;
mod transform;

use auth::{ClientSecret, OAuthClient};
use config::Settings;
use dispatch::{DispatchReport, Dispatcher};
use error::ConfigurationError;
use mailer::{GmailMailer, Mailer};
use merge::CommandMerger;
use models::Process;
use source::{CsvSource, RowSource, SheetsClient};

#[derive(Parser)]
#[command(name = "gradesheet-dispatch")]
#[command(
    about = "Turn a grade sheet into per-student result documents, then email or merge them",
    long_about = None
)]
struct Cli {
    /// Course settings file
    #[arg(long, env = "GRADESHEET_CONFIG", default_value = "courses.json")]
    config: PathBuf,
    /// OAuth client secret downloaded from the Google Cloud console
    #[arg(long, env = "GRADESHEET_CREDENTIALS", default_value = "credentials.json")]
    credentials: PathBuf,
    /// Where the granted token is cached between runs
    #[arg(long, env = "GRADESHEET_TOKEN", default_value = "token.json")]
    token: PathBuf,
    /// Course id; prompted for when omitted
    #[arg(long)]
    course: Option<String>,
    /// Assessment id; prompted for when omitted and the course has assessments
    #[arg(long)]
    assessment: Option<String>,
    /// Process to run; prompted for when omitted
    #[arg(long, value_enum)]
    process: Option<Process>,
    /// Read rows from a CSV export instead of the Sheets API
    #[arg(long)]
    csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let run_id = Uuid::new_v4();
    run(cli).instrument(info_span!("run", %run_id)).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gradesheet_dispatch=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(&cli.config).context("failed to load course settings")?;
    let mut input = io::stdin().lock();
    let mut output = io::stdout();

    let course = match &cli.course {
        Some(course) => course.clone(),
        None => prompt::choose(
            &mut input,
            &mut output,
            "Choose one of the following courses:",
            &settings.course_ids(),
        )?,
    };
    let assessments = settings.assessment_ids(&course)?;
    let assessment = match &cli.assessment {
        Some(assessment) => Some(assessment.clone()),
        None if assessments.is_empty() => None,
        None => Some(prompt::choose(
            &mut input,
            &mut output,
            "Choose one of the following assessments:",
            &assessments,
        )?),
    };

    let config = Arc::new(settings.resolve(&course, assessment.as_deref())?);
    info!("Selected {} ({})", config.selection_label(), config.course_name);

    let mut oauth: Option<Arc<OAuthClient>> = None;
    let rows = match &cli.csv {
        Some(path) => {
            info!("Reading rows from {}", path.display());
            CsvSource::new(path.clone()).fetch(&config.locator).await
        }
        None => {
            let auth = authorize(&cli, &mut input, &mut output).await?;
            oauth = Some(Arc::clone(&auth));
            SheetsClient::new(auth).fetch(&config.locator).await
        }
    }
    .context("failed to fetch grade rows")?;

    let records = transform::transform_rows(&rows, &config, Local::now().date_naive());
    if records.is_empty() {
        warn!("No data found.");
    } else {
        info!("Transformed {} student records", records.len());
    }

    let offered = dispatch::available_processes(&config);
    let process = match cli.process {
        Some(process) if offered.contains(&process) => process,
        Some(process) => {
            return Err(ConfigurationError::ProcessUnavailable(process.to_string()).into());
        }
        None => {
            let labels: Vec<String> = offered.iter().map(ToString::to_string).collect();
            let picked = prompt::choose(
                &mut input,
                &mut output,
                "Choose one of the following processes:",
                &labels,
            )?;
            offered
                .into_iter()
                .find(|process| process.to_string() == picked)
                .context("selected process is not available")?
        }
    };

    let mailer: Option<Arc<dyn Mailer>> = if process == Process::Email {
        let auth = match oauth {
            Some(auth) => auth,
            None => authorize(&cli, &mut input, &mut output).await?,
        };
        Some(Arc::new(GmailMailer::new(auth)) as Arc<dyn Mailer>)
    } else {
        None
    };
    let merger = Arc::new(CommandMerger::new(config.pdf_merge.clone()));

    let report = Dispatcher::new(Arc::clone(&config), mailer, merger)
        .dispatch(process, records)
        .await?;
    log_report(process, &report);

    Ok(())
}

async fn authorize<R: BufRead, W: Write>(
    cli: &Cli,
    input: &mut R,
    output: &mut W,
) -> anyhow::Result<Arc<OAuthClient>> {
    let secret = ClientSecret::from_file(&cli.credentials)?;
    let client = OAuthClient::new(secret, cli.token.clone());
    client
        .authorize(|url| {
            writeln!(output, "Authorize this app by visiting this url: {url}")?;
            prompt::ask(input, output, "Enter the code from that page here: ")
        })
        .await
        .context("authorization failed")?;
    Ok(Arc::new(client))
}

fn log_report(process: Process, report: &DispatchReport) {
    info!(
        "{} finished: {}/{} succeeded",
        process, report.succeeded, report.attempted
    );
    for failure in &report.failures {
        warn!("{} failed for {}: {}", process, failure.student, failure.reason);
    }
}
