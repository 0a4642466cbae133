use crate::calc::AssessmentResult;
use crate::error::{EngineError, Result};
use crate::fees::{FeeStatus, FeeStructure, Money, Payment, PaymentStatus, StudentFee};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub class_id: String,
    pub display_name: String,
    pub admission_no: Option<String>,
    pub student_type: String,
    pub active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct Assessment {
    pub id: String,
    pub class_id: String,
    pub title: String,
    pub term: Option<i64>,
    pub year: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFilter<'a> {
    pub student_id: Option<&'a str>,
    pub class_id: Option<&'a str>,
    pub assessment_id: Option<&'a str>,
}

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    Ok(Student {
        id: r.get(0)?,
        class_id: r.get(1)?,
        display_name: format!("{}, {}", last, first),
        admission_no: r.get(4)?,
        student_type: r.get(5)?,
        active: r.get::<_, i64>(6)? != 0,
        sort_order: r.get(7)?,
    })
}

const STUDENT_COLS: &str =
    "id, class_id, last_name, first_name, admission_no, student_type, active, sort_order";

pub fn student(conn: &Connection, student_id: &str) -> Result<Option<Student>> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLS);
    Ok(conn
        .query_row(&sql, [student_id], student_from_row)
        .optional()?)
}

pub fn students_for_class(conn: &Connection, class_id: &str) -> Result<Vec<Student>> {
    let sql = format!(
        "SELECT {} FROM students WHERE class_id = ? ORDER BY sort_order",
        STUDENT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([class_id], student_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn student_names(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for id in ids {
        if let Some(s) = student(conn, id)? {
            out.insert(s.id, s.display_name);
        }
    }
    Ok(out)
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub fn class_name(conn: &Connection, class_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?)
}

fn assessment_from_row(r: &Row<'_>) -> rusqlite::Result<Assessment> {
    Ok(Assessment {
        id: r.get(0)?,
        class_id: r.get(1)?,
        title: r.get(2)?,
        term: r.get(3)?,
        year: r.get(4)?,
        created_at: r.get(5)?,
    })
}

pub fn assessment(conn: &Connection, assessment_id: &str) -> Result<Option<Assessment>> {
    Ok(conn
        .query_row(
            "SELECT id, class_id, title, term, year, created_at FROM assessments WHERE id = ?",
            [assessment_id],
            assessment_from_row,
        )
        .optional()?)
}

pub fn assessments_for_class(conn: &Connection, class_id: &str) -> Result<Vec<Assessment>> {
    let mut stmt = conn.prepare(
        "SELECT id, class_id, title, term, year, created_at
         FROM assessments
         WHERE class_id = ?
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([class_id], assessment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub fn subject_names(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT id, name FROM subjects")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(rows)
}

pub fn fetch_results(conn: &Connection, filter: ResultFilter<'_>) -> Result<Vec<AssessmentResult>> {
    let mut sql = String::from(
        "SELECT r.student_id, r.assessment_id, r.subject_id, r.score, r.max_marks, r.assessment_date
         FROM assessment_results r
         JOIN assessments a ON a.id = r.assessment_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(id) = filter.student_id {
        sql.push_str(" AND r.student_id = ?");
        binds.push(Value::Text(id.to_string()));
    }
    if let Some(id) = filter.class_id {
        sql.push_str(" AND a.class_id = ?");
        binds.push(Value::Text(id.to_string()));
    }
    if let Some(id) = filter.assessment_id {
        sql.push_str(" AND r.assessment_id = ?");
        binds.push(Value::Text(id.to_string()));
    }
    sql.push_str(" ORDER BY r.assessment_id, r.student_id, r.subject_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(AssessmentResult {
                student_id: r.get(0)?,
                assessment_id: r.get(1)?,
                subject_id: r.get(2)?,
                score: r.get(3)?,
                max_marks: r.get(4)?,
                assessment_date: r.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn upsert_result(conn: &Connection, r: &AssessmentResult) -> Result<()> {
    conn.execute(
        "INSERT INTO assessment_results(
            id, student_id, assessment_id, subject_id, score, max_marks, assessment_date, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, assessment_id, subject_id) DO UPDATE SET
           score = excluded.score,
           max_marks = excluded.max_marks,
           assessment_date = excluded.assessment_date,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &r.student_id,
            &r.assessment_id,
            &r.subject_id,
            r.score,
            r.max_marks,
            &r.assessment_date,
            now_stamp(),
        ),
    )?;
    Ok(())
}

pub fn delete_result(
    conn: &Connection,
    assessment_id: &str,
    student_id: &str,
    subject_id: &str,
) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM assessment_results
         WHERE assessment_id = ? AND student_id = ? AND subject_id = ?",
        (assessment_id, student_id, subject_id),
    )?)
}

fn fee_structure_from_row(r: &Row<'_>) -> rusqlite::Result<FeeStructure> {
    Ok(FeeStructure {
        id: r.get(0)?,
        amount: Money::from_cents(r.get(1)?),
        student_type: r.get(2)?,
        term: r.get(3)?,
        academic_year: r.get(4)?,
        category: r.get(5)?,
    })
}

pub fn fetch_fee_structures(conn: &Connection) -> Result<Vec<FeeStructure>> {
    let mut stmt = conn.prepare(
        "SELECT id, amount_cents, student_type, term, academic_year, category
         FROM fee_structures
         ORDER BY academic_year, term, category, id",
    )?;
    let rows = stmt
        .query_map([], fee_structure_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn fee_structure(conn: &Connection, id: &str) -> Result<Option<FeeStructure>> {
    Ok(conn
        .query_row(
            "SELECT id, amount_cents, student_type, term, academic_year, category
             FROM fee_structures WHERE id = ?",
            [id],
            fee_structure_from_row,
        )
        .optional()?)
}

pub fn insert_fee_structure(conn: &Connection, f: &FeeStructure) -> Result<()> {
    conn.execute(
        "INSERT INTO fee_structures(id, amount_cents, student_type, term, academic_year, category, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &f.id,
            f.amount.cents(),
            &f.student_type,
            f.term,
            &f.academic_year,
            &f.category,
            now_stamp(),
        ),
    )?;
    Ok(())
}

fn student_fee_row(r: &Row<'_>) -> rusqlite::Result<(StudentFee, String)> {
    let fee = StudentFee {
        id: r.get(0)?,
        student_id: r.get(1)?,
        fee_structure_id: r.get(2)?,
        total_billed: Money::from_cents(r.get(3)?),
        total_paid: Money::from_cents(r.get(4)?),
        outstanding: Money::from_cents(r.get(5)?),
        status: FeeStatus::Unpaid,
    };
    Ok((fee, r.get(6)?))
}

/// Cached fee rows exactly as stored. An unknown status is a corrupt cache
/// and fails the read.
pub fn fetch_student_fees(conn: &Connection, student_id: &str) -> Result<Vec<StudentFee>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, fee_structure_id, total_billed_cents, total_paid_cents,
                outstanding_cents, status
         FROM student_fees
         WHERE student_id = ?
         ORDER BY id",
    )?;
    let raw = stmt
        .query_map([student_id], student_fee_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter()
        .map(|(mut fee, status)| -> Result<StudentFee> {
            fee.status = FeeStatus::parse(&status).ok_or_else(|| EngineError::Consistency {
                message: format!("unknown fee status {:?}", status),
                details: json!({
                    "studentId": fee.student_id,
                    "studentFeeId": fee.id,
                    "status": status,
                }),
            })?;
            Ok(fee)
        })
        .collect()
}

/// Fee rows with only their billing columns read. The cached paid,
/// outstanding and status values are reset, so a recompute can run over a
/// cache that no longer parses.
pub fn fetch_fee_bills(conn: &Connection, student_id: &str) -> Result<Vec<StudentFee>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, fee_structure_id, total_billed_cents
         FROM student_fees
         WHERE student_id = ?
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            let billed = Money::from_cents(r.get(3)?);
            Ok(StudentFee {
                id: r.get(0)?,
                student_id: r.get(1)?,
                fee_structure_id: r.get(2)?,
                total_billed: billed,
                total_paid: Money::ZERO,
                outstanding: billed,
                status: FeeStatus::Unpaid,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn students_with_fees(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT student_id FROM student_fees ORDER BY student_id")?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

pub fn insert_student_fee(conn: &Connection, f: &StudentFee) -> Result<()> {
    conn.execute(
        "INSERT INTO student_fees(
            id, student_id, fee_structure_id, total_billed_cents, total_paid_cents,
            outstanding_cents, status, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &f.id,
            &f.student_id,
            &f.fee_structure_id,
            f.total_billed.cents(),
            f.total_paid.cents(),
            f.outstanding.cents(),
            f.status.as_str(),
            now_stamp(),
        ),
    )?;
    Ok(())
}

/// Rewrites the cached aggregate of one StudentFee row. Returns rows touched.
pub fn write_student_fee(conn: &Connection, f: &StudentFee) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE student_fees
         SET total_paid_cents = ?, outstanding_cents = ?, status = ?, updated_at = ?
         WHERE id = ? AND student_id = ?",
        (
            f.total_paid.cents(),
            f.outstanding.cents(),
            f.status.as_str(),
            now_stamp(),
            &f.id,
            &f.student_id,
        ),
    )?)
}

/// Payment ledger for one student. An unknown status fails the read rather
/// than dropping the payment from the totals.
pub fn fetch_payments(conn: &Connection, student_id: &str) -> Result<Vec<Payment>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, fee_id, amount_cents, payment_date, method, status
         FROM payments
         WHERE student_id = ?
         ORDER BY payment_date, created_at, id",
    )?;
    let raw = stmt
        .query_map([student_id], |r| {
            let payment = Payment {
                id: r.get(0)?,
                student_id: r.get(1)?,
                fee_id: r.get(2)?,
                amount_paid: Money::from_cents(r.get(3)?),
                payment_date: r.get(4)?,
                method: r.get(5)?,
                status: PaymentStatus::Pending,
            };
            Ok((payment, r.get::<_, String>(6)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter()
        .map(|(mut payment, status)| -> Result<Payment> {
            payment.status =
                PaymentStatus::parse(&status).ok_or_else(|| EngineError::Consistency {
                    message: format!("unknown payment status {:?}", status),
                    details: json!({
                        "studentId": payment.student_id,
                        "paymentId": payment.id,
                        "status": status,
                    }),
                })?;
            Ok(payment)
        })
        .collect()
}

pub fn insert_payment(conn: &Connection, p: &Payment) -> Result<()> {
    conn.execute(
        "INSERT INTO payments(id, student_id, fee_id, amount_cents, payment_date, method, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &p.id,
            &p.student_id,
            &p.fee_id,
            p.amount_paid.cents(),
            &p.payment_date,
            &p.method,
            p.status.as_str(),
            now_stamp(),
        ),
    )?;
    Ok(())
}
