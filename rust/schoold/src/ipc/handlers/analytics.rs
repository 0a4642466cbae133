use crate::grading;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use serde_json::json;

fn handle_grades_classify(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let percentage = match required_f64(req, "percentage") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match grading::classify(percentage) {
        Ok(level) => ok(&req.id, level.to_json()),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_grades_bands(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let bands: Vec<serde_json::Value> = grading::bands().into_iter().map(|l| l.to_json()).collect();
    ok(&req.id, json!({ "bands": bands }))
}

fn handle_ranking_exam(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let map = match reports::exam_ranking(conn, &assessment_id, &state.config.mark_defaults()) {
        Ok(m) => m,
        Err(e) => return engine_err(&req.id, e),
    };
    let standings: Vec<serde_json::Value> = map
        .ordered()
        .into_iter()
        .map(|(student_id, s)| {
            json!({
                "studentId": student_id,
                "total": s.total,
                "possible": s.possible,
                "percentage": s.percentage,
                "level": s.level,
                "subjectCount": s.subject_count,
                "position": s.position,
            })
        })
        .collect();
    ok(
        &req.id,
        json!({
            "assessmentId": map.assessment_id,
            "snapshotDigest": map.snapshot_digest,
            "standings": standings,
        }),
    )
}

fn handle_pivot_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let card = match reports::report_card(conn, &student_id, &state.config.mark_defaults()) {
        Ok(c) => c,
        Err(e) => return engine_err(&req.id, e),
    };
    match serde_json::to_value(&card.pivot) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.classify" => Some(handle_grades_classify(state, req)),
        "grades.bands" => Some(handle_grades_bands(state, req)),
        "ranking.exam" => Some(handle_ranking_exam(state, req)),
        "pivot.student" => Some(handle_pivot_student(state, req)),
        _ => None,
    }
}
