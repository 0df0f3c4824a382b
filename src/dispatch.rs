use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::config::ResolvedConfig;
use crate::error::{ConfigurationError, DeliveryError, MergeError, RenderError};
use crate::mailer::{compose_result_email, Attachment, Mailer};
use crate::merge::PdfMerger;
use crate::models::{Process, StudentRecord};
use crate::render::{DocxTemplate, DOCX_EXTENSION};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub student: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<Failure>,
}

impl DispatchReport {
    fn record<E: Display>(&mut self, student: String, outcome: Result<(), E>) {
        self.attempted += 1;
        match outcome {
            Ok(()) => self.succeeded += 1,
            Err(err) => {
                error!("{}: {}", student, err);
                self.failures.push(Failure {
                    student,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Schedules job `k` at `start + k * interval`. Jobs run in their own tasks so
/// a slow call never pushes back the ones after it; every task is awaited
/// before the report is returned.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn offset(&self, index: usize) -> Duration {
        self.interval
            .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX))
    }

    pub async fn run<T, F, Fut, E>(&self, jobs: Vec<(String, T)>, op: F) -> DispatchReport
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let op = Arc::new(op);
        let start = Instant::now();
        let mut handles = Vec::with_capacity(jobs.len());

        for (index, (label, job)) in jobs.into_iter().enumerate() {
            let deadline = start + self.offset(index);
            let op = Arc::clone(&op);
            let handle = tokio::spawn(async move {
                sleep_until(deadline).await;
                op(job).await.map_err(|err| err.to_string())
            });
            handles.push((label, handle));
        }

        let mut report = DispatchReport::default();
        for (label, handle) in handles {
            match handle.await {
                Ok(outcome) => report.record(label, outcome),
                Err(join) => report.record(label, Err::<(), _>(join)),
            }
        }
        report
    }
}

/// Processes offered for a selection: generation needs a template and merging
/// needs merge settings.
pub fn available_processes(config: &ResolvedConfig) -> Vec<Process> {
    Process::ALL
        .into_iter()
        .filter(|process| match process {
            Process::Generate => config.template.is_some(),
            Process::Email => true,
            Process::Merge => config.merge.is_some(),
        })
        .collect()
}

pub struct Dispatcher {
    config: Arc<ResolvedConfig>,
    mailer: Option<Arc<dyn Mailer>>,
    merger: Arc<dyn PdfMerger>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ResolvedConfig>,
        mailer: Option<Arc<dyn Mailer>>,
        merger: Arc<dyn PdfMerger>,
    ) -> Self {
        Self {
            config,
            mailer,
            merger,
        }
    }

    pub async fn dispatch(
        &self,
        process: Process,
        records: Vec<StudentRecord>,
    ) -> Result<DispatchReport, DispatchError> {
        if records.is_empty() {
            warn!("No records to {}", process);
            return Ok(DispatchReport::default());
        }
        match process {
            Process::Generate => Ok(generate(&records, &self.config)?),
            Process::Email => {
                let mailer = self
                    .mailer
                    .clone()
                    .ok_or_else(|| ConfigurationError::ProcessUnavailable(process.to_string()))?;
                Ok(email(records, Arc::clone(&self.config), mailer).await)
            }
            Process::Merge => {
                Ok(merge(records, Arc::clone(&self.config), Arc::clone(&self.merger)).await?)
            }
        }
    }
}

/// Renders one `.docx` per record. The template is loaded once; a failed
/// record is logged and the rest still render. The configured artifact
/// extension only applies to what email and merge pick up.
pub fn generate(
    records: &[StudentRecord],
    config: &ResolvedConfig,
) -> Result<DispatchReport, RenderError> {
    let template_path = config.template.as_ref().ok_or(RenderError::NoTemplate)?;
    let template = DocxTemplate::load(template_path)?;
    info!("Loaded template {}", template.path().display());

    let mut report = DispatchReport::default();
    for record in records {
        let outcome = generate_one(&template, record, config);
        report.record(record.label(), outcome);
    }
    Ok(report)
}

fn generate_one(
    template: &DocxTemplate,
    record: &StudentRecord,
    config: &ResolvedConfig,
) -> Result<(), RenderError> {
    let file_name = record.artifact_name(DOCX_EXTENSION)?;
    info!("Generating file for {}", record.label());
    let rendered = template.render(&record.template_fields())?;
    let path = config.output_path(&file_name);
    std::fs::write(&path, rendered).map_err(|source| RenderError::Write {
        path: path.clone(),
        source,
    })?;
    info!("File generated for {} at {}", record.label(), path.display());
    Ok(())
}

/// Emails each student their artifact, paced by the configured interval.
pub async fn email(
    records: Vec<StudentRecord>,
    config: Arc<ResolvedConfig>,
    mailer: Arc<dyn Mailer>,
) -> DispatchReport {
    let pacer = Pacer::new(config.send_interval);
    let jobs = records.into_iter().map(|r| (r.label(), r)).collect();

    pacer
        .run(jobs, move |record: StudentRecord| {
            let config = Arc::clone(&config);
            let mailer = Arc::clone(&mailer);
            async move {
                let file_name = record.artifact_name(&config.artifact_extension)?;
                info!("Emailing document file to {}", record.label());
                let path = config.output_path(&file_name);
                let bytes = std::fs::read(&path).map_err(|source| DeliveryError::Attachment {
                    path: path.clone(),
                    source,
                })?;
                let message = compose_result_email(&record, &config, Attachment::new(file_name, bytes))?;
                mailer.send(&message).await?;
                info!("File emailed to {}", record.label());
                Ok::<(), DeliveryError>(())
            }
        })
        .await
}

/// Merges `<prefix><stem>.pdf` and `<stem>.pdf` into `<stem><suffix>.pdf` per
/// student, paced like email delivery. The prefixed PDF comes from an earlier
/// run and must already exist.
pub async fn merge(
    records: Vec<StudentRecord>,
    config: Arc<ResolvedConfig>,
    merger: Arc<dyn PdfMerger>,
) -> Result<DispatchReport, ConfigurationError> {
    let settings = config
        .merge
        .clone()
        .ok_or_else(|| ConfigurationError::ProcessUnavailable(Process::Merge.to_string()))?;
    let pacer = Pacer::new(config.send_interval);
    let jobs = records.into_iter().map(|r| (r.label(), r)).collect();

    let report = pacer
        .run(jobs, move |record: StudentRecord| {
            let config = Arc::clone(&config);
            let merger = Arc::clone(&merger);
            let settings = settings.clone();
            async move {
                let stem = record.artifact_stem()?;
                let inputs = vec![
                    config.output_path(&format!("{}{}.pdf", settings.prefix, stem)),
                    config.output_path(&format!("{}.pdf", stem)),
                ];
                let output = config.output_path(&format!("{}{}.pdf", stem, settings.suffix));
                info!("Merging PDF files for {}", stem);
                merger.merge(&inputs, &output).await?;
                info!("Merged PDF written to {}", output.display());
                Ok::<(), MergeError>(())
            }
        })
        .await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::mailer::OutgoingEmail;
    use crate::models::sample_record;
    use crate::render::{build_docx, read_part};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingMailer {
        delay: Duration,
        sends: Mutex<Vec<(String, Instant)>>,
    }

    impl RecordingMailer {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                sends: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
            self.sends
                .lock()
                .unwrap()
                .push((email.to.clone(), Instant::now()));
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMerger {
        delay: Duration,
        calls: Mutex<Vec<(Vec<PathBuf>, PathBuf, Instant)>>,
    }

    #[async_trait]
    impl PdfMerger for RecordingMerger {
        async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
            self.calls
                .lock()
                .unwrap()
                .push((inputs.to_vec(), output.to_path_buf(), Instant::now()));
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn students() -> Vec<StudentRecord> {
        vec![
            sample_record("Jane", "Doe"),
            sample_record("Sam", "Lee"),
            sample_record("Ana", "Ruiz"),
        ]
    }

    fn write_artifacts(config: &ResolvedConfig, records: &[StudentRecord]) {
        for record in records {
            let name = record.artifact_name(&config.artifact_extension).unwrap();
            std::fs::write(config.output_path(&name), b"doc").unwrap();
        }
    }

    #[test]
    fn offsets_grow_by_interval() {
        let pacer = Pacer::new(Duration::from_millis(7500));
        assert_eq!(pacer.offset(0), Duration::ZERO);
        assert_eq!(pacer.offset(1), Duration::from_millis(7500));
        assert_eq!(pacer.offset(4), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn email_sends_are_paced_without_blocking() {
        let dir = tempdir().unwrap();
        let config = Arc::new(test_settings(dir.path()).resolve("id607001", Some("a1")).unwrap());
        let records = students();
        write_artifacts(&config, &records);

        let mailer = Arc::new(RecordingMailer::new(Duration::from_secs(20)));
        let start = Instant::now();
        let report = email(records, Arc::clone(&config), mailer.clone()).await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 3);
        let sends = mailer.sends.lock().unwrap().clone();
        assert_eq!(
            sends.iter().map(|(to, _)| to.as_str()).collect::<Vec<_>>(),
            vec!["jane.doe@example.com", "sam.lee@example.com", "ana.ruiz@example.com"]
        );
        for (k, (_, at)) in sends.iter().enumerate() {
            let elapsed = at.duration_since(start);
            let expected = Duration::from_millis(7500) * k as u32;
            assert!(elapsed >= expected, "send {k} fired early at {elapsed:?}");
            assert!(elapsed < expected + Duration::from_secs(1), "send {k} waited on earlier sends");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_attachment_fails_only_that_student() {
        let dir = tempdir().unwrap();
        let config = Arc::new(test_settings(dir.path()).resolve("id607001", Some("a1")).unwrap());
        let records = students();
        write_artifacts(&config, &records[..2]);

        let mailer = Arc::new(RecordingMailer::new(Duration::ZERO));
        let report = email(records, Arc::clone(&config), mailer.clone()).await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].student, "ana-ruiz");
        assert_eq!(mailer.sends.lock().unwrap().len(), 2);
    }

    #[test]
    fn generation_continues_past_failed_records() {
        let dir = tempdir().unwrap();
        let config = test_settings(dir.path()).resolve("id607001", Some("a1")).unwrap();
        let template = config.template.clone().unwrap();
        std::fs::create_dir_all(template.parent().unwrap()).unwrap();
        std::fs::write(
            &template,
            build_docx("<w:t>{first_name} {last_name}: {crit_one_score}</w:t>"),
        )
        .unwrap();

        let mut records = students();
        records.insert(1, sample_record("", "Nobody"));
        records[0].weighted = Some(vec![crate::models::WeightedScore {
            field: "crit_one_score".to_string(),
            value: 32.0,
        }]);

        let report = generate(&records, &config).unwrap();
        assert_eq!(report.attempted, 4);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failures[0].student, "learner 99001");

        let jane = std::fs::read(config.output_path("jane-doe.docx")).unwrap();
        assert_eq!(read_part(&jane, "word/document.xml"), "<w:t>Jane Doe: 32.00</w:t>");
        let sam = std::fs::read(config.output_path("sam-lee.docx")).unwrap();
        assert_eq!(read_part(&sam, "word/document.xml"), "<w:t>Sam Lee: </w:t>");
    }

    #[test]
    fn generation_without_template_file_is_an_error() {
        let dir = tempdir().unwrap();
        let config = test_settings(dir.path()).resolve("id721001", Some("a1")).unwrap();
        assert!(matches!(
            generate(&students(), &config),
            Err(RenderError::Template { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn merge_pairs_prefixed_and_current_pdfs() {
        let dir = tempdir().unwrap();
        let config = Arc::new(
            test_settings(dir.path())
                .resolve("id607001", Some("overall"))
                .unwrap(),
        );
        let merger = Arc::new(RecordingMerger::default());
        let report = merge(students()[..2].to_vec(), Arc::clone(&config), merger.clone())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        let calls = merger.calls.lock().unwrap().clone();
        assert_eq!(
            calls[0].0,
            vec![
                config.output_path("01-assessment-jane-doe.pdf"),
                config.output_path("jane-doe.pdf")
            ]
        );
        assert_eq!(calls[0].1, config.output_path("jane-doe-final.pdf"));
    }

    #[tokio::test(start_paused = true)]
    async fn merges_are_paced_without_blocking() {
        let dir = tempdir().unwrap();
        let config = Arc::new(
            test_settings(dir.path())
                .resolve("id607001", Some("overall"))
                .unwrap(),
        );
        let merger = Arc::new(RecordingMerger {
            delay: Duration::from_secs(20),
            ..RecordingMerger::default()
        });
        let start = Instant::now();
        let report = merge(students(), Arc::clone(&config), merger.clone())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 3);
        let calls = merger.calls.lock().unwrap().clone();
        assert_eq!(
            calls.iter().map(|(_, output, _)| output.clone()).collect::<Vec<_>>(),
            vec![
                config.output_path("jane-doe-final.pdf"),
                config.output_path("sam-lee-final.pdf"),
                config.output_path("ana-ruiz-final.pdf"),
            ]
        );
        for (k, (_, _, at)) in calls.iter().enumerate() {
            let elapsed = at.duration_since(start);
            let expected = Duration::from_millis(7500) * k as u32;
            assert!(elapsed >= expected, "merge {k} started early at {elapsed:?}");
            assert!(elapsed < expected + Duration::from_secs(1), "merge {k} waited on earlier merges");
        }
    }

    #[test]
    fn overall_generation_still_writes_docx() {
        let dir = tempdir().unwrap();
        let config = test_settings(dir.path())
            .resolve("id607001", Some("overall"))
            .unwrap();
        assert_eq!(config.artifact_extension, "pdf");
        let template = config.template.clone().unwrap();
        std::fs::create_dir_all(template.parent().unwrap()).unwrap();
        std::fs::write(&template, build_docx("<w:t>{first_name}</w:t>")).unwrap();

        let report = generate(&[sample_record("Jane", "Doe")], &config).unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(!config.output_path("jane-doe.pdf").exists());
        let jane = std::fs::read(config.output_path("jane-doe.docx")).unwrap();
        assert_eq!(read_part(&jane, "word/document.xml"), "<w:t>Jane</w:t>");
    }

    #[tokio::test]
    async fn merge_requires_merge_settings() {
        let dir = tempdir().unwrap();
        let config = Arc::new(test_settings(dir.path()).resolve("id607001", Some("a1")).unwrap());
        let result = merge(students(), config, Arc::new(RecordingMerger::default())).await;
        assert!(matches!(result, Err(ConfigurationError::ProcessUnavailable(_))));
    }

    #[tokio::test]
    async fn dispatcher_routes_empty_input_to_no_work() {
        let dir = tempdir().unwrap();
        let config = Arc::new(test_settings(dir.path()).resolve("id721001", Some("a1")).unwrap());
        let dispatcher = Dispatcher::new(config, None, Arc::new(RecordingMerger::default()));
        let report = dispatcher.dispatch(Process::Generate, Vec::new()).await.unwrap();
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn email_without_mailer_is_unavailable() {
        let dir = tempdir().unwrap();
        let config = Arc::new(test_settings(dir.path()).resolve("id721001", Some("a1")).unwrap());
        let dispatcher = Dispatcher::new(config, None, Arc::new(RecordingMerger::default()));
        let result = dispatcher.dispatch(Process::Email, students()).await;
        assert!(matches!(
            result,
            Err(DispatchError::Configuration(ConfigurationError::ProcessUnavailable(_)))
        ));
    }

    #[test]
    fn processes_depend_on_selection() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let a1 = settings.resolve("id607001", Some("a1")).unwrap();
        assert_eq!(available_processes(&a1), vec![Process::Generate, Process::Email]);
        let overall = settings.resolve("id607001", Some("overall")).unwrap();
        assert_eq!(available_processes(&overall), Process::ALL.to_vec());
    }
}
