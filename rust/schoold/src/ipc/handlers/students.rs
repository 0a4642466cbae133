use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, now_stamp};
use serde_json::json;
use uuid::Uuid;

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (class_id, last_name, first_name) = match (
        required_str(req, "classId"),
        required_str(req, "lastName"),
        required_str(req, "firstName"),
    ) {
        (Ok(c), Ok(l), Ok(f)) => (c, l, f),
        (Err(resp), _, _) | (_, Err(resp), _) | (_, _, Err(resp)) => return resp,
    };
    let admission_no = match optional_str(req, "admissionNo") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_type = match optional_str(req, "studentType") {
        Ok(v) => v.unwrap_or_else(|| "day".to_string()).to_ascii_lowercase(),
        Err(resp) => return resp,
    };
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    match store::class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return engine_err(&req.id, e),
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(
            id, class_id, last_name, first_name, admission_no, student_type, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            &admission_no,
            &student_type,
            if active { 1 } else { 0 },
            sort_order,
            now_stamp(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(
        &req.id,
        json!({ "studentId": student_id, "sortOrder": sort_order }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let students = match store::students_for_class(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let students: Vec<serde_json::Value> = students
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "displayName": s.display_name,
                "admissionNo": s.admission_no,
                "studentType": s.student_type,
                "active": s.active,
                "sortOrder": s.sort_order,
            })
        })
        .collect();
    ok(&req.id, json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
