use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, required_str, write_output};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use serde_json::json;

fn ok_json<T: serde::Serialize>(req: &Request, v: &T) -> serde_json::Value {
    match serde_json::to_value(v) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_class_ranking(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match reports::class_ranking(conn, &assessment_id, &state.config.mark_defaults()) {
        Ok(r) => ok_json(req, &r),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_report_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match reports::report_card(conn, &student_id, &state.config.mark_defaults()) {
        Ok(r) => ok_json(req, &r),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_fee_balances(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match reports::fee_balances(conn, &class_id, state.config.fee_allocation) {
        Ok(r) => ok_json(req, &r),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_export_ranking_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (assessment_id, out_path) =
        match (required_str(req, "assessmentId"), required_str(req, "outPath")) {
            (Ok(a), Ok(o)) => (a, o),
            (Err(resp), _) | (_, Err(resp)) => return resp,
        };
    let ranking = match reports::class_ranking(conn, &assessment_id, &state.config.mark_defaults())
    {
        Ok(r) => r,
        Err(e) => return engine_err(&req.id, e),
    };
    if let Err(resp) = write_output(req, &out_path, &reports::ranking_csv(&ranking)) {
        return resp;
    }
    tracing::info!(assessment_id = %assessment_id, path = %out_path, "ranking exported");
    ok(
        &req.id,
        json!({ "path": out_path, "rowsExported": ranking.rows.len() }),
    )
}

fn handle_export_fee_balances_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (class_id, out_path) = match (required_str(req, "classId"), required_str(req, "outPath")) {
        (Ok(c), Ok(o)) => (c, o),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let balances = match reports::fee_balances(conn, &class_id, state.config.fee_allocation) {
        Ok(b) => b,
        Err(e) => return engine_err(&req.id, e),
    };
    if let Err(resp) = write_output(req, &out_path, &reports::fee_balances_csv(&balances)) {
        return resp;
    }
    tracing::info!(class_id = %class_id, path = %out_path, "fee balances exported");
    ok(
        &req.id,
        json!({ "path": out_path, "rowsExported": balances.rows.len() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.classRanking" => Some(handle_class_ranking(state, req)),
        "reports.reportCard" => Some(handle_report_card(state, req)),
        "reports.feeBalances" => Some(handle_fee_balances(state, req)),
        "reports.exportRankingCsv" => Some(handle_export_ranking_csv(state, req)),
        "reports.exportFeeBalancesCsv" => Some(handle_export_fee_balances_csv(state, req)),
        _ => None,
    }
}
