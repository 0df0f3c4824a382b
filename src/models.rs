use std::collections::BTreeMap;
use std::fmt;

use clap::ValueEnum;

use crate::error::IdentityError;

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScore {
    pub field: String,
    pub value: f64,
}

impl WeightedScore {
    pub fn formatted(&self) -> String {
        format!("{:.2}", self.value)
    }
}

/// One student's row after transformation. Built once per raw row and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub first_name: String,
    pub last_name: String,
    pub learner_id: String,
    pub email_address: String,
    pub date: String,
    pub course_name: String,
    pub assessment_name: Option<String>,
    /// Every non-identity layout column, in layout order.
    pub fields: BTreeMap<String, String>,
    /// `None` when the selection declares no weighting formula.
    pub weighted: Option<Vec<WeightedScore>>,
}

impl StudentRecord {
    /// `lowercase(first)-lowercase(last)`, the stem shared by every artifact of
    /// this student.
    pub fn artifact_stem(&self) -> Result<String, IdentityError> {
        let first = self.first_name.trim();
        let last = self.last_name.trim();
        if first.is_empty() {
            return Err(IdentityError::Missing("first name"));
        }
        if last.is_empty() {
            return Err(IdentityError::Missing("last name"));
        }
        Ok(format!("{}-{}", first.to_lowercase(), last.to_lowercase()))
    }

    pub fn artifact_name(&self, extension: &str) -> Result<String, IdentityError> {
        Ok(format!("{}.{}", self.artifact_stem()?, extension))
    }

    pub fn recipient(&self) -> Result<String, IdentityError> {
        let address = self.email_address.trim();
        if address.is_empty() {
            return Err(IdentityError::Missing("email address"));
        }
        Ok(address.to_lowercase())
    }

    /// Display label for logs; falls back to the learner id when names are blank.
    pub fn label(&self) -> String {
        match self.artifact_stem() {
            Ok(stem) => stem,
            Err(_) if !self.learner_id.trim().is_empty() => {
                format!("learner {}", self.learner_id.trim())
            }
            Err(_) => "unnamed record".to_string(),
        }
    }

    pub fn template_fields(&self) -> BTreeMap<String, String> {
        let mut map = self.fields.clone();
        map.insert("first_name".to_string(), self.first_name.clone());
        map.insert("last_name".to_string(), self.last_name.clone());
        map.insert("learner_id".to_string(), self.learner_id.clone());
        map.insert("email_address".to_string(), self.email_address.clone());
        map.insert("date".to_string(), self.date.clone());
        map.insert("course_name".to_string(), self.course_name.clone());
        if let Some(name) = &self.assessment_name {
            map.insert("assessment_name".to_string(), name.clone());
        }
        for score in self.weighted.iter().flatten() {
            map.insert(score.field.clone(), score.formatted());
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Process {
    /// Render one Word document per student
    Generate,
    /// Email each student their generated document
    Email,
    /// Merge each student's two PDF artifacts into one
    Merge,
}

impl Process {
    pub const ALL: [Process; 3] = [Process::Generate, Process::Email, Process::Merge];
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Process::Generate => "generate word docx",
            Process::Email => "email word docx",
            Process::Merge => "merge pdf",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
pub(crate) fn sample_record(first: &str, last: &str) -> StudentRecord {
    StudentRecord {
        first_name: first.to_string(),
        last_name: last.to_string(),
        learner_id: "99001".to_string(),
        email_address: format!("{}.{}@Example.com", first, last),
        date: "3/2/2026".to_string(),
        course_name: "Programming 4".to_string(),
        assessment_name: Some("Project".to_string()),
        fields: BTreeMap::new(),
        weighted: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_is_lowercased_regardless_of_input_casing() {
        assert_eq!(sample_record("Jane", "Doe").artifact_stem().unwrap(), "jane-doe");
        assert_eq!(sample_record("JANE", "Doe").artifact_stem().unwrap(), "jane-doe");
        assert_eq!(
            sample_record("jane", "DOE").artifact_name("docx").unwrap(),
            "jane-doe.docx"
        );
    }

    #[test]
    fn blank_names_cannot_name_an_artifact() {
        let record = sample_record("", "Doe");
        assert_eq!(
            record.artifact_stem(),
            Err(IdentityError::Missing("first name"))
        );
        assert_eq!(record.label(), "learner 99001");
    }

    #[test]
    fn recipient_is_lowercased() {
        let record = sample_record("Jane", "Doe");
        assert_eq!(record.recipient().unwrap(), "jane.doe@example.com");
    }

    #[test]
    fn template_fields_omit_absent_weighted_scores() {
        let mut record = sample_record("Jane", "Doe");
        record.fields.insert("crit_one".to_string(), "8".to_string());
        let fields = record.template_fields();
        assert_eq!(fields.get("crit_one").map(String::as_str), Some("8"));
        assert!(!fields.contains_key("crit_one_score"));

        record.weighted = Some(vec![WeightedScore {
            field: "crit_one_score".to_string(),
            value: 32.0,
        }]);
        let fields = record.template_fields();
        assert_eq!(fields.get("crit_one_score").map(String::as_str), Some("32.00"));
        assert_eq!(fields.get("assessment_name").map(String::as_str), Some("Project"));
    }

    #[test]
    fn process_labels_match_prompt_wording() {
        assert_eq!(Process::Generate.to_string(), "generate word docx");
        assert_eq!(Process::Email.to_string(), "email word docx");
        assert_eq!(Process::Merge.to_string(), "merge pdf");
    }
}
