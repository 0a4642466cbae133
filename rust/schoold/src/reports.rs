use crate::calc::{format_marks, round_off_1_decimal, Cell, MarkDefaults};
use crate::error::{EngineError, Result};
use crate::fees::{self, FeeAllocation, FeeStatus, Money};
use crate::grading::AchievementLevel;
use crate::pivot::{self, ExamColumn, Pivot};
use crate::ranking::{self, RankingMap};
use crate::store::{self, ResultFilter};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingRow {
    pub student_id: String,
    pub display_name: String,
    pub total: f64,
    pub possible: f64,
    pub percentage: Cell,
    pub level: Option<AchievementLevel>,
    pub subject_count: usize,
    pub position: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRanking {
    pub assessment_id: String,
    pub exam_title: String,
    pub class_id: String,
    pub class_name: String,
    pub snapshot_digest: String,
    pub rows: Vec<RankingRow>,
}

fn rank_in(conn: &Connection, assessment_id: &str, defaults: &MarkDefaults) -> Result<RankingMap> {
    let results = store::fetch_results(
        conn,
        ResultFilter {
            assessment_id: Some(assessment_id),
            ..ResultFilter::default()
        },
    )?;
    ranking::rank_exam(&results, defaults)
}

/// Ranks one exam from a single read snapshot of its result rows.
pub fn exam_ranking(
    conn: &Connection,
    assessment_id: &str,
    defaults: &MarkDefaults,
) -> Result<RankingMap> {
    let tx = conn.unchecked_transaction()?;
    if store::assessment(&tx, assessment_id)?.is_none() {
        return Err(EngineError::NotFound("assessment"));
    }
    let map = rank_in(&tx, assessment_id, defaults)?;
    tx.commit()?;
    Ok(map)
}

/// Ranked rows with names. Exam, class, results and names come from one
/// read transaction.
pub fn class_ranking(
    conn: &Connection,
    assessment_id: &str,
    defaults: &MarkDefaults,
) -> Result<ClassRanking> {
    let tx = conn.unchecked_transaction()?;
    let a = store::assessment(&tx, assessment_id)?.ok_or(EngineError::NotFound("assessment"))?;
    let class_name = store::class_name(&tx, &a.class_id)?.unwrap_or_default();
    let map = rank_in(&tx, assessment_id, defaults)?;
    let ids: Vec<&str> = map.standings.keys().map(|k| k.as_str()).collect();
    let names = store::student_names(&tx, &ids)?;
    tx.commit()?;
    let rows = map
        .ordered()
        .into_iter()
        .map(|(id, s)| RankingRow {
            student_id: id.to_string(),
            display_name: names.get(id).cloned().unwrap_or_else(|| id.to_string()),
            total: s.total,
            possible: s.possible,
            percentage: match s.percentage {
                Cell::Value(p) => Cell::Value(round_off_1_decimal(p)),
                Cell::NoData => Cell::NoData,
            },
            level: s.level,
            subject_count: s.subject_count,
            position: s.position,
        })
        .collect();

    Ok(ClassRanking {
        assessment_id: a.id,
        exam_title: a.title,
        class_id: a.class_id,
        class_name,
        snapshot_digest: map.snapshot_digest,
        rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSummary {
    pub assessment_id: String,
    pub title: String,
    pub total: Cell,
    pub possible: Cell,
    pub percentage: Cell,
    pub level: Option<AchievementLevel>,
    pub position: Option<u32>,
    pub class_size: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student_id: String,
    pub display_name: String,
    pub class_id: String,
    pub class_name: String,
    pub pivot: Pivot,
    pub exams: Vec<ExamSummary>,
}

/// Subject × exam pivot for one student across their class's exams, plus
/// per-exam standing. Every exam is ranked from the same read snapshot.
pub fn report_card(
    conn: &Connection,
    student_id: &str,
    defaults: &MarkDefaults,
) -> Result<ReportCard> {
    let tx = conn.unchecked_transaction()?;
    let student = store::student(&tx, student_id)?.ok_or(EngineError::NotFound("student"))?;
    let class_name = store::class_name(&tx, &student.class_id)?.unwrap_or_default();
    let assessments = store::assessments_for_class(&tx, &student.class_id)?;
    let results = store::fetch_results(
        &tx,
        ResultFilter {
            class_id: Some(student.class_id.as_str()),
            ..ResultFilter::default()
        },
    )?;
    let subject_names = store::subject_names(&tx)?;
    tx.commit()?;

    let mut rankings: HashMap<String, RankingMap> = HashMap::new();
    for a in &assessments {
        let exam_rows: Vec<_> = results
            .iter()
            .filter(|r| r.assessment_id == a.id)
            .cloned()
            .collect();
        if exam_rows.is_empty() {
            continue;
        }
        rankings.insert(a.id.clone(), ranking::rank_exam(&exam_rows, defaults)?);
    }

    let columns: Vec<ExamColumn> = assessments
        .iter()
        .map(|a| ExamColumn {
            assessment_id: a.id.clone(),
            title: a.title.clone(),
        })
        .collect();
    let pivot = pivot::build_pivot(&results, student_id, &columns, &subject_names, &rankings)?;

    let exams = pivot
        .exams
        .iter()
        .map(|c| {
            let map = rankings.get(&c.assessment_id);
            let standing = map.and_then(|m| m.get(student_id));
            ExamSummary {
                assessment_id: c.assessment_id.clone(),
                title: c.title.clone(),
                total: standing.map(|s| Cell::Value(s.total)).unwrap_or(Cell::NoData),
                possible: standing
                    .map(|s| Cell::Value(s.possible))
                    .unwrap_or(Cell::NoData),
                percentage: match standing.map(|s| s.percentage) {
                    Some(Cell::Value(p)) => Cell::Value(round_off_1_decimal(p)),
                    _ => Cell::NoData,
                },
                level: standing.and_then(|s| s.level),
                position: standing.map(|s| s.position),
                class_size: map.map(|m| m.standings.len()).unwrap_or(0),
            }
        })
        .collect();

    Ok(ReportCard {
        student_id: student.id,
        display_name: student.display_name,
        class_id: student.class_id,
        class_name,
        pivot,
        exams,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBalanceRow {
    pub student_id: String,
    pub display_name: String,
    pub admission_no: Option<String>,
    pub total_billed: Money,
    pub total_paid: Money,
    pub outstanding: Money,
    pub status: FeeStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBalances {
    pub class_id: String,
    pub class_name: String,
    pub rows: Vec<FeeBalanceRow>,
    pub total_billed: Money,
    pub total_paid: Money,
    pub total_outstanding: Money,
}

/// Class fee balances recomputed from the ledger, not read from the cache.
pub fn fee_balances(
    conn: &Connection,
    class_id: &str,
    allocation: FeeAllocation,
) -> Result<FeeBalances> {
    let tx = conn.unchecked_transaction()?;
    let class_name = store::class_name(&tx, class_id)?.ok_or(EngineError::NotFound("class"))?;
    let mut rows = Vec::new();
    for s in store::students_for_class(&tx, class_id)? {
        let fees_rows = store::fetch_fee_bills(&tx, &s.id)?;
        let payments = store::fetch_payments(&tx, &s.id)?;
        let summary = fees::reconcile_fees(&s.id, &fees_rows, &payments, allocation);
        rows.push(FeeBalanceRow {
            student_id: s.id,
            display_name: s.display_name,
            admission_no: s.admission_no,
            total_billed: summary.total_billed,
            total_paid: summary.total_paid,
            outstanding: summary.outstanding,
            status: summary.status,
        });
    }
    tx.commit()?;

    let total_billed = rows.iter().map(|r| r.total_billed).sum();
    let total_paid = rows.iter().map(|r| r.total_paid).sum();
    let total_outstanding = rows.iter().map(|r| r.outstanding).sum();
    Ok(FeeBalances {
        class_id: class_id.to_string(),
        class_name,
        rows,
        total_billed,
        total_paid,
        total_outstanding,
    })
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn cell_text(c: Cell) -> String {
    match c {
        Cell::Value(v) => format_marks(v),
        Cell::NoData => "-".to_string(),
    }
}

pub fn ranking_csv(r: &ClassRanking) -> String {
    let mut csv = String::from("position,student_id,student_name,total,possible,percentage,level\n");
    for row in &r.rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            row.position,
            csv_quote(&row.student_id),
            csv_quote(&row.display_name),
            format_marks(row.total),
            format_marks(row.possible),
            cell_text(row.percentage),
            row.level.map(|l| l.code()).unwrap_or("-"),
        ));
    }
    csv
}

pub fn fee_balances_csv(b: &FeeBalances) -> String {
    let mut csv =
        String::from("student_id,student_name,admission_no,total_billed,total_paid,outstanding,status\n");
    for row in &b.rows {
        csv.push_str(&format!(
            "{},{},{},{:.2},{:.2},{:.2},{}\n",
            csv_quote(&row.student_id),
            csv_quote(&row.display_name),
            csv_quote(row.admission_no.as_deref().unwrap_or("")),
            row.total_billed.as_units(),
            row.total_paid.as_units(),
            row.outstanding.as_units(),
            row.status.as_str(),
        ));
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_csv_quotes_names_and_marks_missing_levels() {
        let report = ClassRanking {
            assessment_id: "e1".into(),
            exam_title: "Exam 1".into(),
            class_id: "c1".into(),
            class_name: "Grade 7".into(),
            snapshot_digest: String::new(),
            rows: vec![
                RankingRow {
                    student_id: "s1".into(),
                    display_name: "Otieno, Amina".into(),
                    total: 150.0,
                    possible: 200.0,
                    percentage: Cell::Value(75.0),
                    level: Some(AchievementLevel::EE2),
                    subject_count: 2,
                    position: 1,
                },
                RankingRow {
                    student_id: "s2".into(),
                    display_name: "Kamau, Brian".into(),
                    total: 0.0,
                    possible: 0.0,
                    percentage: Cell::NoData,
                    level: None,
                    subject_count: 0,
                    position: 2,
                },
            ],
        };
        let csv = ranking_csv(&report);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[1], "1,s1,\"Otieno, Amina\",150,200,75,EE2");
        assert_eq!(lines[2], "2,s2,\"Kamau, Brian\",0,0,-,-");
    }

    fn seeded_workspace() -> (std::path::PathBuf, Connection) {
        let ws = std::env::temp_dir().join(format!("schoold-reports-{}", uuid::Uuid::new_v4()));
        let conn = crate::db::open_db(&ws).expect("open");
        conn.execute_batch(
            "INSERT INTO classes(id, name, created_at) VALUES('c1', 'Grade 7', 'now');
             INSERT INTO students(id, class_id, last_name, first_name, sort_order)
                 VALUES('s1', 'c1', 'Ouma', 'Ken', 0), ('s2', 'c1', 'Akinyi', 'Joy', 1);
             INSERT INTO subjects(id, name) VALUES('m1', 'Mathematics');
             INSERT INTO assessments(id, class_id, title, created_at)
                 VALUES('e1', 'c1', 'Exam 1', 'now');",
        )
        .expect("seed");
        for (student, score) in [("s1", 40.0), ("s2", 45.0)] {
            store::upsert_result(
                &conn,
                &crate::calc::AssessmentResult {
                    student_id: student.into(),
                    assessment_id: "e1".into(),
                    subject_id: "m1".into(),
                    score,
                    max_marks: Some(50.0),
                    assessment_date: None,
                },
            )
            .expect("result");
        }
        (ws, conn)
    }

    #[test]
    fn class_ranking_reads_one_snapshot_and_releases_it() {
        let (ws, conn) = seeded_workspace();
        let defaults = MarkDefaults {
            default_max_marks: None,
        };

        let report = class_ranking(&conn, "e1", &defaults).expect("ranking");
        assert!(conn.is_autocommit());
        assert_eq!(report.class_name, "Grade 7");
        assert_eq!(report.exam_title, "Exam 1");
        assert_eq!(report.rows[0].display_name, "Akinyi, Joy");
        assert_eq!(report.rows[0].position, 1);
        assert_eq!(report.rows[1].position, 2);
        let map = exam_ranking(&conn, "e1", &defaults).expect("exam ranking");
        assert_eq!(report.snapshot_digest, map.snapshot_digest);

        // A failed lookup rolls its read transaction back.
        assert!(matches!(
            class_ranking(&conn, "missing", &defaults),
            Err(EngineError::NotFound("assessment"))
        ));
        assert!(conn.is_autocommit());
        assert!(class_ranking(&conn, "e1", &defaults).is_ok());

        drop(conn);
        let _ = std::fs::remove_dir_all(ws);
    }
}
