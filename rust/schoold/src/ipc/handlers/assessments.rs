use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::pivot::{sort_exams, ExamColumn};
use crate::store::{self, now_stamp};
use serde_json::json;
use uuid::Uuid;

fn handle_assessments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let (term, year) = match (optional_i64(req, "term"), optional_i64(req, "year")) {
        (Ok(t), Ok(y)) => (t, y),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match store::class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return engine_err(&req.id, e),
    }

    let assessment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assessments(id, class_id, title, term, year, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&assessment_id, &class_id, &title, term, year, now_stamp()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }
    ok(&req.id, json!({ "assessmentId": assessment_id }))
}

fn handle_assessments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let assessments = match store::assessments_for_class(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };

    // Listed in the same exam order the report card uses.
    let mut columns: Vec<ExamColumn> = assessments
        .iter()
        .map(|a| ExamColumn {
            assessment_id: a.id.clone(),
            title: a.title.clone(),
        })
        .collect();
    sort_exams(&mut columns);
    let out: Vec<serde_json::Value> = columns
        .iter()
        .filter_map(|c| assessments.iter().find(|a| a.id == c.assessment_id))
        .map(|a| {
            json!({
                "id": a.id,
                "classId": a.class_id,
                "title": a.title,
                "term": a.term,
                "year": a.year,
                "createdAt": a.created_at,
            })
        })
        .collect();
    ok(&req.id, json!({ "assessments": out }))
}

/// Administrative edit of title/term/year. Results keep referencing the
/// assessment by id.
fn handle_assessments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };
    let existing = match store::assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return engine_err(&req.id, e),
    };

    let title = match patch.get("title") {
        None => existing.title,
        Some(v) => match v.as_str().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "patch.title must be a non-empty string",
                    None,
                )
            }
        },
    };
    let numeric = |key: &str, current: Option<i64>| -> Result<Option<i64>, serde_json::Value> {
        match patch.get(key) {
            None => Ok(current),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be an integer or null", key),
                    None,
                )
            }),
        }
    };
    let term = match numeric("term", existing.term) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year = match numeric("year", existing.year) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) = conn.execute(
        "UPDATE assessments SET title = ?, term = ?, year = ? WHERE id = ?",
        (&title, term, year, &assessment_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "assessmentId": assessment_id, "title": title, "term": term, "year": year }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.create" => Some(handle_assessments_create(state, req)),
        "assessments.list" => Some(handle_assessments_list(state, req)),
        "assessments.update" => Some(handle_assessments_update(state, req)),
        _ => None,
    }
}
