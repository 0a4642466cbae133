use crate::calc::{format_marks, AssessmentResult, Cell};
use crate::error::{EngineError, Result};
use crate::ranking::RankingMap;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

pub const TOTALS_ROW: &str = "Totals";
pub const POSITION_ROW: &str = "Position";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamColumn {
    pub assessment_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PivotCell {
    Score(Cell),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotRow {
    pub subject: String,
    pub cells: Vec<PivotCell>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pivot {
    pub student_id: String,
    pub exams: Vec<ExamColumn>,
    pub rows: Vec<PivotRow>,
}

fn embedded_number(title: &str) -> Option<u64> {
    let digits: String = title
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Canonical exam order: by the first number in the title ("Exam 2" before
/// "Exam 10"), titles without a number last in title order.
pub fn sort_exams(exams: &mut [ExamColumn]) {
    exams.sort_by(|a, b| {
        let ord = match (embedded_number(&a.title), embedded_number(&b.title)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        ord.then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.assessment_id.cmp(&b.assessment_id))
    });
}

/// Subject × exam matrix for one student. The Totals and Position trailers
/// come from `rankings` (keyed by assessment id) so they always agree with
/// the class ranking.
pub fn build_pivot(
    results: &[AssessmentResult],
    student_id: &str,
    exams: &[ExamColumn],
    subject_names: &HashMap<String, String>,
    rankings: &HashMap<String, RankingMap>,
) -> Result<Pivot> {
    let mut columns = exams.to_vec();
    sort_exams(&mut columns);
    let col_of: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.assessment_id.as_str(), i))
        .collect();

    let mut by_subject: BTreeMap<String, Vec<Cell>> = BTreeMap::new();
    for r in results.iter().filter(|r| r.student_id == student_id) {
        if !r.score.is_finite() {
            return Err(EngineError::input(format!(
                "score for subject {} is not a number",
                r.subject_id
            )));
        }
        let Some(&col) = col_of.get(r.assessment_id.as_str()) else {
            continue;
        };
        let name = subject_names
            .get(&r.subject_id)
            .cloned()
            .unwrap_or_else(|| r.subject_id.clone());
        let cells = by_subject
            .entry(name)
            .or_insert_with(|| vec![Cell::NoData; columns.len()]);
        if cells[col] != Cell::NoData {
            return Err(EngineError::input(format!(
                "duplicate result for subject {} in exam {}",
                r.subject_id, columns[col].title
            )));
        }
        cells[col] = Cell::Value(r.score);
    }

    let mut rows: Vec<PivotRow> = by_subject
        .into_iter()
        .map(|(subject, cells)| PivotRow {
            subject,
            cells: cells.into_iter().map(PivotCell::Score).collect(),
        })
        .collect();

    let mut totals = Vec::with_capacity(columns.len());
    let mut positions = Vec::with_capacity(columns.len());
    for c in &columns {
        let standing = rankings
            .get(&c.assessment_id)
            .and_then(|m| m.get(student_id));
        match standing {
            Some(s) => {
                totals.push(PivotCell::Text(format!(
                    "{}/{}",
                    format_marks(s.total),
                    format_marks(s.possible)
                )));
                positions.push(PivotCell::Text(s.position.to_string()));
            }
            None => {
                totals.push(PivotCell::Score(Cell::NoData));
                positions.push(PivotCell::Score(Cell::NoData));
            }
        }
    }
    rows.push(PivotRow {
        subject: TOTALS_ROW.to_string(),
        cells: totals,
    });
    rows.push(PivotRow {
        subject: POSITION_ROW.to_string(),
        cells: positions,
    });

    Ok(Pivot {
        student_id: student_id.to_string(),
        exams: columns,
        rows,
    })
}
