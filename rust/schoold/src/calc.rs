use crate::error::{EngineError, Result};
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentResult {
    pub student_id: String,
    pub assessment_id: String,
    pub subject_id: String,
    pub score: f64,
    /// None when the row was captured without an out-of value.
    pub max_marks: Option<f64>,
    pub assessment_date: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkDefaults {
    pub default_max_marks: Option<f64>,
}

/// A computed figure or an explicit "no data" marker. Serializes as a
/// number or `"-"`, so a missing score never reads as zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Value(f64),
    NoData,
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Cell::Value(v) => s.serialize_f64(*v),
            Cell::NoData => s.serialize_str("-"),
        }
    }
}

/// 1-decimal rounding used for displayed percentages: `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Renders marks without a trailing ".0" for whole numbers.
pub fn format_marks(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        let s = format!("{:.2}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Checks one result row and returns its effective max marks.
pub fn checked_max_marks(r: &AssessmentResult, defaults: &MarkDefaults) -> Result<f64> {
    if !r.score.is_finite() {
        return Err(EngineError::input(format!(
            "score for student {} subject {} is not a number",
            r.student_id, r.subject_id
        )));
    }
    if r.score < 0.0 {
        return Err(EngineError::input(format!(
            "negative score {} for student {} subject {}",
            r.score, r.student_id, r.subject_id
        )));
    }
    let max = match r.max_marks.or(defaults.default_max_marks) {
        Some(m) => m,
        None => {
            return Err(EngineError::input(format!(
                "missing max_marks for student {} subject {} and no default is configured",
                r.student_id, r.subject_id
            )))
        }
    };
    if !max.is_finite() || max <= 0.0 {
        return Err(EngineError::input(format!(
            "max_marks must be > 0 (student {} subject {})",
            r.student_id, r.subject_id
        )));
    }
    if r.score > max {
        return Err(EngineError::input(format!(
            "score {} exceeds max_marks {} for student {} subject {}",
            r.score, max, r.student_id, r.subject_id
        )));
    }
    Ok(max)
}
