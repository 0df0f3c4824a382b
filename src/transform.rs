use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use tracing::warn;

use crate::config::{ResolvedConfig, IDENTITY_COLUMNS};
use crate::models::{StudentRecord, WeightedScore};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CriterionWeight {
    pub criterion: String,
    pub weight: f64,
}

/// A declarative weight vector. Each criterion yields a `<criterion>_score`
/// field of `raw * weight * 10`, rounded half-up to 2 places.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightingFormula {
    criteria: Vec<CriterionWeight>,
}

impl WeightingFormula {
    pub fn new(criteria: Vec<CriterionWeight>) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &[CriterionWeight] {
        &self.criteria
    }

    pub fn apply(&self, fields: &BTreeMap<String, String>) -> Vec<WeightedScore> {
        let mut scores = Vec::with_capacity(self.criteria.len());
        for criterion in &self.criteria {
            let raw = fields.get(&criterion.criterion).map(|v| v.trim()).unwrap_or("");
            match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => scores.push(WeightedScore {
                    field: format!("{}_score", criterion.criterion),
                    value: weighted_score(value, criterion.weight),
                }),
                _ => warn!(
                    "criterion {} has non-numeric value {:?}; skipping its weighted score",
                    criterion.criterion, raw
                ),
            }
        }
        scores
    }
}

pub fn weighted_score(raw: f64, weight: f64) -> f64 {
    round_half_up(raw * weight * 10.0, 2)
}

/// Half-up decimal rounding. Products like `7 * 0.15 * 10` land a hair under
/// the true decimal value in binary, so the scaled value is snapped to a
/// micro-unit grid before rounding.
pub fn round_half_up(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    let scaled = value * factor;
    let snapped = (scaled * 1e6).round() / 1e6;
    (snapped + 0.5).floor() / factor
}

/// `D/M/YYYY` without zero padding.
pub fn format_date(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.day(), date.month(), date.year())
}

/// Maps raw rows to records, one per row in input order. An empty input yields
/// an empty list; the caller decides how to report it.
pub fn transform_rows(
    rows: &[Vec<String>],
    config: &ResolvedConfig,
    today: NaiveDate,
) -> Vec<StudentRecord> {
    let date = format_date(today);
    rows.iter()
        .map(|row| transform_row(row, config, &date))
        .collect()
}

fn transform_row(row: &[String], config: &ResolvedConfig, date: &str) -> StudentRecord {
    let cell = |name: &str| -> String {
        config
            .layout
            .index_of(name)
            .and_then(|idx| row.get(idx))
            .cloned()
            .unwrap_or_default()
    };

    let fields: BTreeMap<String, String> = config
        .layout
        .columns()
        .iter()
        .filter(|column| !IDENTITY_COLUMNS.contains(&column.as_str()))
        .map(|column| (column.clone(), cell(column)))
        .collect();

    let weighted = config.formula.as_ref().map(|formula| formula.apply(&fields));

    StudentRecord {
        first_name: cell("first_name"),
        last_name: cell("last_name"),
        learner_id: cell("learner_id"),
        email_address: cell("email_address"),
        date: date.to_string(),
        course_name: config.course_name.clone(),
        assessment_name: config.assessment_name.clone(),
        fields,
        weighted,
    }
}
