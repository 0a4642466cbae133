use crate::calc::{checked_max_marks, AssessmentResult, MarkDefaults};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, ResultFilter};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;

const RESULTS_UPSERT_MAX_ROWS: usize = 5000;
const CSV_HEADER: [&str; 4] = ["student_id", "subject_id", "score", "max_marks"];

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<crate::error::EngineError> for HandlerErr {
    fn from(e: crate::error::EngineError) -> Self {
        HandlerErr {
            code: e.code(),
            details: e.details(),
            message: e.to_string(),
        }
    }
}

struct PendingRow {
    line: usize,
    student_id: String,
    subject_id: String,
    score: Option<f64>,
    max_marks: Option<f64>,
    assessment_date: Option<String>,
}

/// Validates every row against the assessment, roster and mark rules, then
/// writes all of them in one transaction. Any bad row means nothing is
/// written.
fn apply_rows(
    conn: &Connection,
    assessment_id: &str,
    rows: Vec<PendingRow>,
    defaults: &MarkDefaults,
) -> Result<usize, HandlerErr> {
    let assessment = store::assessment(conn, assessment_id)?.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "assessment not found".to_string(),
        details: Some(json!({ "assessmentId": assessment_id })),
    })?;

    let mut problems: Vec<serde_json::Value> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut ready: Vec<AssessmentResult> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut problem = |message: String| {
            problems.push(json!({
                "row": row.line,
                "studentId": row.student_id,
                "subjectId": row.subject_id,
                "message": message,
            }));
        };
        let Some(score) = row.score else {
            problem("score must be a number".to_string());
            continue;
        };
        match store::student(conn, &row.student_id)? {
            Some(s) if s.class_id == assessment.class_id => {}
            Some(_) => {
                problem("student is not in the assessment's class".to_string());
                continue;
            }
            None => {
                problem("student not found".to_string());
                continue;
            }
        }
        if !store::subject_exists(conn, &row.subject_id)? {
            problem("subject not found".to_string());
            continue;
        }
        if !seen.insert((row.student_id.clone(), row.subject_id.clone())) {
            problem("duplicate row for student and subject".to_string());
            continue;
        }
        let mut result = AssessmentResult {
            student_id: row.student_id.clone(),
            assessment_id: assessment.id.clone(),
            subject_id: row.subject_id.clone(),
            score,
            max_marks: row.max_marks,
            assessment_date: row.assessment_date.clone(),
        };
        match checked_max_marks(&result, defaults) {
            Ok(max) => {
                // Stored explicitly so later default changes never rewrite history.
                result.max_marks = Some(max);
                ready.push(result);
            }
            Err(e) => problem(e.to_string()),
        }
    }

    if !problems.is_empty() {
        return Err(HandlerErr {
            code: "bad_input",
            message: format!("{} result row(s) rejected", problems.len()),
            details: Some(json!({ "rows": problems })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for r in &ready {
        store::upsert_result(&tx, r)?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(ready.len())
}

fn parse_rows(req: &Request) -> Result<Vec<PendingRow>, HandlerErr> {
    let Some(rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing rows array".to_string(),
            details: None,
        });
    };
    if rows.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "rows must not be empty".to_string(),
            details: None,
        });
    }
    if rows.len() > RESULTS_UPSERT_MAX_ROWS {
        return Err(HandlerErr {
            code: "bad_params",
            message: "too many rows in one request".to_string(),
            details: Some(json!({ "count": rows.len(), "max": RESULTS_UPSERT_MAX_ROWS })),
        });
    }

    let mut out = Vec::with_capacity(rows.len());
    for (i, r) in rows.iter().enumerate() {
        let text = |key: &str| {
            r.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let (Some(student_id), Some(subject_id)) = (text("studentId"), text("subjectId")) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "each row needs studentId and subjectId".to_string(),
                details: Some(json!({ "row": i })),
            });
        };
        let max_marks = match r.get("maxMarks") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => match v.as_f64() {
                Some(m) => Some(m),
                None => {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: "maxMarks must be a number or null".to_string(),
                        details: Some(json!({ "row": i })),
                    })
                }
            },
        };
        out.push(PendingRow {
            line: i,
            student_id,
            subject_id,
            score: r.get("score").and_then(|v| v.as_f64()),
            max_marks,
            assessment_date: text("assessmentDate"),
        });
    }
    Ok(out)
}

fn handle_results_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let rows = match parse_rows(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match apply_rows(conn, &assessment_id, rows, &state.config.mark_defaults()) {
        Ok(n) => ok(&req.id, json!({ "upserted": n })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_results_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (assessment_id, student_id, subject_id) = match (
        required_str(req, "assessmentId"),
        required_str(req, "studentId"),
        required_str(req, "subjectId"),
    ) {
        (Ok(a), Ok(st), Ok(su)) => (a, st, su),
        (Err(resp), _, _) | (_, Err(resp), _) | (_, _, Err(resp)) => return resp,
    };
    match store::delete_result(conn, &assessment_id, &student_id, &subject_id) {
        Ok(0) => err(&req.id, "not_found", "result not found", None),
        Ok(n) => ok(&req.id, json!({ "deleted": n })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (student_id, class_id, assessment_id) = match (
        optional_str(req, "studentId"),
        optional_str(req, "classId"),
        optional_str(req, "assessmentId"),
    ) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        (Err(resp), _, _) | (_, Err(resp), _) | (_, _, Err(resp)) => return resp,
    };
    let filter = ResultFilter {
        student_id: student_id.as_deref(),
        class_id: class_id.as_deref(),
        assessment_id: assessment_id.as_deref(),
    };
    let results = match store::fetch_results(conn, filter) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let rows: Vec<serde_json::Value> = results
        .into_iter()
        .map(|r| {
            json!({
                "studentId": r.student_id,
                "assessmentId": r.assessment_id,
                "subjectId": r.subject_id,
                "score": r.score,
                "maxMarks": r.max_marks,
                "assessmentDate": r.assessment_date,
            })
        })
        .collect();
    ok(&req.id, json!({ "results": rows }))
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                buf.push('"');
                chars.next();
                continue;
            }
            in_quotes = !in_quotes;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(std::mem::take(&mut buf));
            continue;
        }
        buf.push(ch);
    }
    out.push(buf);
    out
}

/// Fixed-column CSV adapter: `student_id,subject_id,score,max_marks`.
fn parse_results_csv(text: &str) -> Result<Vec<PendingRow>, HandlerErr> {
    let mut lines = text.lines().enumerate();
    let header = lines
        .by_ref()
        .find(|(_, l)| !l.trim().is_empty())
        .map(|(_, l)| parse_csv_record(l.trim_start_matches('\u{feff}')))
        .unwrap_or_default();
    let header: Vec<String> = header
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    if header != CSV_HEADER {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("CSV header must be {}", CSV_HEADER.join(",")),
            details: Some(json!({ "header": header })),
        });
    }

    let mut out = Vec::new();
    for (line_no, raw) in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let fields = parse_csv_record(line);
        if fields.len() != CSV_HEADER.len() {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("expected {} CSV columns", CSV_HEADER.len()),
                details: Some(json!({ "line": line_no + 1 })),
            });
        }
        let max_marks = match fields[3].trim() {
            "" => None,
            t => match t.parse::<f64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: "max_marks must be numeric when provided".to_string(),
                        details: Some(json!({ "line": line_no + 1 })),
                    })
                }
            },
        };
        out.push(PendingRow {
            line: line_no + 1,
            student_id: fields[0].trim().to_string(),
            subject_id: fields[1].trim().to_string(),
            score: fields[2].trim().parse::<f64>().ok(),
            max_marks,
            assessment_date: None,
        });
    }
    if out.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "CSV has no data rows".to_string(),
            details: None,
        });
    }
    Ok(out)
}

fn handle_results_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let in_path = match required_str(req, "inPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let text = match std::fs::read_to_string(&in_path) {
        Ok(t) => t,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": in_path })),
            )
        }
    };
    let rows = match parse_results_csv(&text) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match apply_rows(conn, &assessment_id, rows, &state.config.mark_defaults()) {
        Ok(n) => {
            tracing::info!(assessment_id = %assessment_id, rows = n, "results imported");
            ok(&req.id, json!({ "upserted": n, "path": in_path }))
        }
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.upsert" => Some(handle_results_upsert(state, req)),
        "results.delete" => Some(handle_results_delete(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        "results.importCsv" => Some(handle_results_import_csv(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_record_handles_quotes() {
        assert_eq!(
            parse_csv_record("a,\"b, c\",\"d\"\"e\""),
            vec!["a".to_string(), "b, c".to_string(), "d\"e".to_string()]
        );
    }

    #[test]
    fn csv_requires_exact_header_and_numeric_max_marks() {
        let good = "student_id,subject_id,score,max_marks\ns1,math,40,50\ns2,math,35,\n";
        let rows = parse_results_csv(good).ok().expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].max_marks, Some(50.0));
        assert_eq!(rows[1].max_marks, None);
        assert_eq!(rows[1].line, 3);

        assert!(parse_results_csv("learner,subject,marks\ns1,math,40\n").is_err());
        assert!(parse_results_csv("student_id,subject_id,score,max_marks\ns1,math,40,abc\n").is_err());
    }

    #[test]
    fn unparseable_score_is_kept_for_row_level_rejection() {
        let rows = parse_results_csv("student_id,subject_id,score,max_marks\ns1,math,abs,50\n")
            .ok()
            .expect("rows");
        assert_eq!(rows[0].score, None);
    }
}
