use crate::calc::{checked_max_marks, AssessmentResult, Cell, MarkDefaults};
use crate::error::{EngineError, Result};
use crate::grading::{self, AchievementLevel};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Standing {
    pub total: f64,
    pub possible: f64,
    pub percentage: Cell,
    pub level: Option<AchievementLevel>,
    pub subject_count: usize,
    pub position: u32,
}

#[derive(Debug, Clone)]
pub struct RankingMap {
    pub assessment_id: String,
    pub snapshot_digest: String,
    pub standings: BTreeMap<String, Standing>,
}

impl RankingMap {
    pub fn get(&self, student_id: &str) -> Option<&Standing> {
        self.standings.get(student_id)
    }

    /// Standings ordered by position, then student id.
    pub fn ordered(&self) -> Vec<(&str, &Standing)> {
        let mut out: Vec<(&str, &Standing)> = self
            .standings
            .iter()
            .map(|(id, s)| (id.as_str(), s))
            .collect();
        out.sort_by(|a, b| a.1.position.cmp(&b.1.position).then_with(|| a.0.cmp(b.0)));
        out
    }
}

// Totals closer than 1/1000 of a mark are the same total.
fn tie_key(total: f64) -> i64 {
    (total * 1000.0).round() as i64
}

/// Ranks one exam from its complete result set. Ties on total share a
/// position and the next distinct total takes the next integer.
pub fn rank_exam(results: &[AssessmentResult], defaults: &MarkDefaults) -> Result<RankingMap> {
    let Some(first) = results.first() else {
        return Err(EngineError::EmptyData(
            "data unavailable for this exam".to_string(),
        ));
    };
    let assessment_id = first.assessment_id.clone();

    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut sums: BTreeMap<String, (f64, f64, usize)> = BTreeMap::new();
    for r in results {
        if r.assessment_id != assessment_id {
            return Err(EngineError::input(format!(
                "ranking input mixes assessments {} and {}",
                assessment_id, r.assessment_id
            )));
        }
        if !seen.insert((r.student_id.as_str(), r.subject_id.as_str())) {
            return Err(EngineError::input(format!(
                "duplicate result for student {} subject {}",
                r.student_id, r.subject_id
            )));
        }
        let max = checked_max_marks(r, defaults)?;
        let entry = sums.entry(r.student_id.clone()).or_insert((0.0, 0.0, 0));
        entry.0 += r.score;
        entry.1 += max;
        entry.2 += 1;
    }

    let mut distinct: Vec<i64> = sums.values().map(|(t, _, _)| tie_key(*t)).collect();
    distinct.sort_unstable_by(|a, b| b.cmp(a));
    distinct.dedup();

    let mut standings = BTreeMap::new();
    for (student_id, (total, possible, subject_count)) in sums {
        let key = tie_key(total);
        let position = distinct
            .iter()
            .position(|k| *k == key)
            .map(|i| i as u32 + 1)
            .unwrap_or(0);
        let percentage = if possible > 0.0 {
            Cell::Value(100.0 * total / possible)
        } else {
            Cell::NoData
        };
        let level = match percentage {
            Cell::Value(p) => Some(grading::classify(p.clamp(0.0, 100.0))?),
            Cell::NoData => None,
        };
        standings.insert(
            student_id,
            Standing {
                total,
                possible,
                percentage,
                level,
                subject_count,
                position,
            },
        );
    }

    Ok(RankingMap {
        assessment_id,
        snapshot_digest: snapshot_digest(results),
        standings,
    })
}

/// SHA-256 over the canonically ordered rows, independent of input order.
pub fn snapshot_digest(results: &[AssessmentResult]) -> String {
    let mut rows: Vec<&AssessmentResult> = results.iter().collect();
    rows.sort_by(|a, b| {
        a.assessment_id
            .cmp(&b.assessment_id)
            .then_with(|| a.student_id.cmp(&b.student_id))
            .then_with(|| a.subject_id.cmp(&b.subject_id))
            .then_with(|| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
    });
    let mut hasher = Sha256::new();
    for r in rows {
        hasher.update(r.assessment_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(r.student_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(r.subject_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(r.score.to_le_bytes());
        match r.max_marks {
            Some(m) => {
                hasher.update([1u8]);
                hasher.update(m.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    format!("{:x}", hasher.finalize())
}
