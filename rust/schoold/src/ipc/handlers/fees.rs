use crate::error::EngineError;
use crate::fees::{self, FeeStructure, Money, NewPayment, PaymentStatus};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, db_conn_mut, optional_i64, optional_str, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde_json::json;
use uuid::Uuid;

fn money_param(req: &Request, key: &str) -> Result<Money, serde_json::Value> {
    let v = required_f64(req, key)?;
    Money::from_units(v).map_err(|e| engine_err(&req.id, e))
}

fn to_json<T: serde::Serialize>(req: &Request, v: &T) -> serde_json::Value {
    match serde_json::to_value(v) {
        Ok(v) => v,
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_structures_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let amount = match money_param(req, "amount") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if amount <= Money::ZERO {
        return engine_err(&req.id, EngineError::input("amount must be > 0"));
    }
    let (student_type, category) = match (
        required_str(req, "studentType"),
        required_str(req, "category"),
    ) {
        (Ok(t), Ok(c)) => (t.to_ascii_lowercase(), c),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let (term, academic_year) = match (
        optional_i64(req, "term"),
        optional_str(req, "academicYear"),
    ) {
        (Ok(t), Ok(y)) => (t, y),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let structure = FeeStructure {
        id: Uuid::new_v4().to_string(),
        amount,
        student_type,
        term,
        academic_year,
        category,
    };
    if let Err(e) = store::insert_fee_structure(conn, &structure) {
        return engine_err(&req.id, e);
    }
    ok(
        &req.id,
        json!({ "feeStructureId": structure.id, "structure": to_json(req, &structure) }),
    )
}

fn handle_structures_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match store::fetch_fee_structures(conn) {
        Ok(list) => ok(&req.id, json!({ "structures": to_json(req, &list) })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_fees_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let allocation = state.config.fee_allocation;
    let (student_id, fee_structure_id) = match (
        required_str(req, "studentId"),
        required_str(req, "feeStructureId"),
    ) {
        (Ok(s), Ok(f)) => (s, f),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match fees::assign_fee(conn, &student_id, &fee_structure_id, allocation) {
        Ok(summary) => ok(&req.id, json!({ "summary": to_json(req, &summary) })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_fees_bill_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let allocation = state.config.fee_allocation;
    let (class_id, fee_structure_id) = match (
        required_str(req, "classId"),
        required_str(req, "feeStructureId"),
    ) {
        (Ok(c), Ok(f)) => (c, f),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match fees::bill_class(conn, &class_id, &fee_structure_id, allocation) {
        Ok(outcome) => ok(&req.id, to_json(req, &outcome)),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_payments_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let allocation = state.config.fee_allocation;
    let (student_id, method) = match (required_str(req, "studentId"), required_str(req, "method")) {
        (Ok(s), Ok(m)) => (s, m),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let amount_paid = match money_param(req, "amountPaid") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let (fee_id, payment_date, status) = match (
        optional_str(req, "feeId"),
        optional_str(req, "paymentDate"),
        optional_str(req, "status"),
    ) {
        (Ok(f), Ok(d), Ok(s)) => (f, d, s),
        (Err(resp), _, _) | (_, Err(resp), _) | (_, _, Err(resp)) => return resp,
    };
    let status = match status {
        None => PaymentStatus::Completed,
        Some(s) => match PaymentStatus::parse(&s) {
            Some(p) => p,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: completed, pending, failed",
                    Some(json!({ "status": s })),
                )
            }
        },
    };
    if let Some(d) = &payment_date {
        if chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_err() {
            return err(
                &req.id,
                "bad_params",
                "paymentDate must be YYYY-MM-DD",
                Some(json!({ "paymentDate": d })),
            );
        }
    }

    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let new = NewPayment {
        student_id,
        fee_id,
        amount_paid,
        payment_date,
        method,
        status,
    };
    match fees::record_payment(conn, new, allocation) {
        Ok((payment, summary)) => ok(
            &req.id,
            json!({
                "paymentId": payment.id,
                "payment": to_json(req, &payment),
                "summary": to_json(req, &summary),
            }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_payments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match store::fetch_payments(conn, &student_id) {
        Ok(list) => ok(&req.id, json!({ "payments": to_json(req, &list) })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_fees_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let allocation = state.config.fee_allocation;
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match fees::reconcile(conn, &student_id, allocation) {
        Ok(summary) => ok(&req.id, to_json(req, &summary)),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_fees_verify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match fees::verify(conn, &student_id, state.config.fee_allocation) {
        Ok(summary) => ok(&req.id, json!({ "consistent": true, "summary": to_json(req, &summary) })),
        Err(e) => engine_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.structures.create" => Some(handle_structures_create(state, req)),
        "fees.structures.list" => Some(handle_structures_list(state, req)),
        "fees.assign" => Some(handle_fees_assign(state, req)),
        "fees.billClass" => Some(handle_fees_bill_class(state, req)),
        "payments.record" => Some(handle_payments_record(state, req)),
        "payments.list" => Some(handle_payments_list(state, req)),
        "fees.reconcile" => Some(handle_fees_reconcile(state, req)),
        "fees.verify" => Some(handle_fees_verify(state, req)),
        _ => None,
    }
}
