use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigurationError;
use crate::transform::{CriterionWeight, WeightingFormula};

pub const IDENTITY_COLUMNS: [&str; 4] = ["first_name", "last_name", "learner_id", "email_address"];

const DEFAULT_COLUMNS: [&str; 9] = [
    "first_name",
    "last_name",
    "learner_id",
    "email_address",
    "points",
    "percentage",
    "grade",
    "crit_one",
    "crit_two",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub address: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MergeCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for MergeCommand {
    fn default() -> Self {
        Self {
            program: "pdfunite".to_string(),
            args: Vec::new(),
        }
    }
}

/// Naming of the two PDFs combined per student: `<prefix><stem>.pdf` and
/// `<stem>.pdf` go in, `<stem><suffix>.pdf` comes out.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MergeSettings {
    #[serde(default = "default_merge_prefix")]
    pub prefix: String,
    #[serde(default = "default_merge_suffix")]
    pub suffix: String,
}

fn default_merge_prefix() -> String {
    "01-assessment-".to_string()
}

fn default_merge_suffix() -> String {
    "-final".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct AssessmentEntry {
    assessment_name: String,
    spreadsheet_range: Option<String>,
    word_docx_name: Option<String>,
    columns: Option<Vec<String>>,
    weights: Option<Vec<CriterionWeight>>,
    artifact_extension: Option<String>,
    merge: Option<MergeSettings>,
}

#[derive(Debug, Clone, Deserialize)]
struct CourseEntry {
    course_name: String,
    spreadsheet_id: String,
    spreadsheet_range: Option<String>,
    word_docx_name: Option<String>,
    columns: Option<Vec<String>>,
    weights: Option<Vec<CriterionWeight>>,
    artifact_extension: Option<String>,
    merge: Option<MergeSettings>,
    #[serde(default)]
    assessments: BTreeMap<String, AssessmentEntry>,
}

/// The static course table, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub sender: Sender,
    #[serde(default = "default_templates_dir")]
    templates_dir: PathBuf,
    #[serde(default = "default_output_root")]
    output_root: PathBuf,
    #[serde(default = "default_send_interval_ms")]
    send_interval_ms: u64,
    #[serde(default)]
    pdf_merge: MergeCommand,
    courses: BTreeMap<String, CourseEntry>,
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("assessments")
}

fn default_output_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_send_interval_ms() -> u64 {
    7500
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLocator {
    pub spreadsheet_id: String,
    pub range: String,
}

/// Ordered column names; position `i` names cell `i` of every raw row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout(Vec<String>);

impl ColumnLayout {
    pub fn new(columns: Vec<String>) -> Self {
        Self(columns)
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|column| column == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self(DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect())
    }
}

/// Everything downstream stages need for one course/assessment selection.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub course_id: String,
    pub course_name: String,
    pub assessment_id: Option<String>,
    pub assessment_name: Option<String>,
    pub locator: SheetLocator,
    pub output_dir: PathBuf,
    pub template: Option<PathBuf>,
    pub layout: ColumnLayout,
    pub formula: Option<WeightingFormula>,
    pub artifact_extension: String,
    pub merge: Option<MergeSettings>,
    pub send_interval: Duration,
    pub sender: Sender,
    pub pdf_merge: MergeCommand,
}

impl ResolvedConfig {
    pub fn selection_label(&self) -> String {
        match &self.assessment_id {
            Some(assessment) => format!("{}/{}", self.course_id, assessment),
            None => self.course_id.clone(),
        }
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    /// Creates the output directory when absent. Safe to call repeatedly.
    pub fn ensure_output_dir(&self) -> Result<(), ConfigurationError> {
        if self.output_dir.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.output_dir).map_err(|source| {
            ConfigurationError::OutputDir {
                path: self.output_dir.clone(),
                source,
            }
        })?;
        info!("{} directories successfully created", self.selection_label());
        Ok(())
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_json(&content, base_dir).map_err(|err| match err {
            SettingsParse::Json(source) => ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            },
            SettingsParse::Invalid(err) => err,
        })
    }

    fn from_json(content: &str, base_dir: PathBuf) -> Result<Self, SettingsParse> {
        let mut settings: Settings = serde_json::from_str(content).map_err(SettingsParse::Json)?;
        settings.base_dir = base_dir;
        settings.validate().map_err(SettingsParse::Invalid)?;
        Ok(settings)
    }

    pub fn course_ids(&self) -> Vec<String> {
        self.courses.keys().cloned().collect()
    }

    pub fn assessment_ids(&self, course: &str) -> Result<Vec<String>, ConfigurationError> {
        let entry = self
            .courses
            .get(course)
            .ok_or_else(|| ConfigurationError::UnknownCourse(course.to_string()))?;
        Ok(entry.assessments.keys().cloned().collect())
    }

    /// Resolves a selection and makes sure its output directory exists.
    pub fn resolve(
        &self,
        course: &str,
        assessment: Option<&str>,
    ) -> Result<ResolvedConfig, ConfigurationError> {
        let resolved = self.build(course, assessment)?;
        resolved.ensure_output_dir()?;
        Ok(resolved)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.courses.is_empty() {
            return Err(ConfigurationError::Invalid("no courses configured".to_string()));
        }
        if self.sender.address.trim().is_empty() {
            return Err(ConfigurationError::Invalid("sender address is empty".to_string()));
        }
        for (course_id, entry) in &self.courses {
            if entry.assessments.is_empty() {
                self.build(course_id, None)?;
            }
            for assessment_id in entry.assessments.keys() {
                self.build(course_id, Some(assessment_id))?;
            }
        }
        Ok(())
    }

    fn build(
        &self,
        course_id: &str,
        assessment_id: Option<&str>,
    ) -> Result<ResolvedConfig, ConfigurationError> {
        let course = self
            .courses
            .get(course_id)
            .ok_or_else(|| ConfigurationError::UnknownCourse(course_id.to_string()))?;

        let assessment = match assessment_id {
            Some(id) => Some(course.assessments.get(id).ok_or_else(|| {
                ConfigurationError::UnknownAssessment {
                    course: course_id.to_string(),
                    assessment: id.to_string(),
                }
            })?),
            None if !course.assessments.is_empty() => {
                return Err(ConfigurationError::MissingAssessment(course_id.to_string()));
            }
            None => None,
        };

        let label = match assessment_id {
            Some(id) => format!("{course_id}/{id}"),
            None => course_id.to_string(),
        };

        let range = assessment
            .and_then(|a| a.spreadsheet_range.clone())
            .or_else(|| course.spreadsheet_range.clone())
            .ok_or_else(|| ConfigurationError::Invalid(format!("{label} has no spreadsheet_range")))?;

        let layout = assessment
            .and_then(|a| a.columns.clone())
            .or_else(|| course.columns.clone())
            .map(ColumnLayout::new)
            .unwrap_or_default();
        for column in IDENTITY_COLUMNS {
            if !layout.contains(column) {
                return Err(ConfigurationError::Invalid(format!(
                    "{label} layout is missing identity column `{column}`"
                )));
            }
        }

        let weights = assessment
            .and_then(|a| a.weights.clone())
            .or_else(|| course.weights.clone())
            .unwrap_or_default();
        for weight in &weights {
            if !layout.contains(&weight.criterion) {
                return Err(ConfigurationError::Invalid(format!(
                    "{label} weights criterion `{}` which is not a layout column",
                    weight.criterion
                )));
            }
            if !weight.weight.is_finite() || weight.weight < 0.0 {
                return Err(ConfigurationError::Invalid(format!(
                    "{label} has an invalid weight for `{}`",
                    weight.criterion
                )));
            }
        }
        let formula = (!weights.is_empty()).then(|| WeightingFormula::new(weights));

        let template = assessment
            .and_then(|a| a.word_docx_name.clone())
            .or_else(|| course.word_docx_name.clone())
            .map(|name| self.base_dir.join(&self.templates_dir).join(name));

        let mut output_dir = self.base_dir.join(&self.output_root).join(course_id);
        if let Some(id) = assessment_id {
            output_dir.push(id);
        }

        Ok(ResolvedConfig {
            course_id: course_id.to_string(),
            course_name: course.course_name.clone(),
            assessment_id: assessment_id.map(str::to_string),
            assessment_name: assessment.map(|a| a.assessment_name.clone()),
            locator: SheetLocator {
                spreadsheet_id: course.spreadsheet_id.clone(),
                range,
            },
            output_dir,
            template,
            layout,
            formula,
            artifact_extension: assessment
                .and_then(|a| a.artifact_extension.clone())
                .or_else(|| course.artifact_extension.clone())
                .unwrap_or_else(|| "docx".to_string()),
            merge: assessment
                .and_then(|a| a.merge.clone())
                .or_else(|| course.merge.clone()),
            send_interval: Duration::from_millis(self.send_interval_ms),
            sender: self.sender.clone(),
            pdf_merge: self.pdf_merge.clone(),
        })
    }
}

enum SettingsParse {
    Json(serde_json::Error),
    Invalid(ConfigurationError),
}

#[cfg(test)]
pub(crate) fn test_settings(base_dir: &Path) -> Settings {
    Settings::from_json(include_str!("../courses.example.json"), base_dir.to_path_buf())
        .unwrap_or_else(|_| panic!("example settings should be valid"))
}
