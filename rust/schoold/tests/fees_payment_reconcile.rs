mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

struct Fixture {
    workspace: PathBuf,
    class_id: String,
    student_id: String,
    tuition: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, tag: &str) -> Fixture {
    let workspace = temp_dir(&format!("schoold-fees-{}", tag));
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = str_field(
        &request_ok(stdin, reader, "c", "classes.create", json!({ "name": "Grade 7" })),
        "classId",
    );
    let student_id = str_field(
        &request_ok(
            stdin,
            reader,
            "s",
            "students.create",
            json!({ "classId": class_id, "lastName": "Mutua", "firstName": "Peter", "studentType": "day" }),
        ),
        "studentId",
    );
    let tuition = str_field(
        &request_ok(
            stdin,
            reader,
            "fs",
            "fees.structures.create",
            json!({ "amount": 5000, "studentType": "day", "category": "Tuition", "term": 1, "academicYear": "2026" }),
        ),
        "feeStructureId",
    );
    Fixture {
        workspace,
        class_id,
        student_id,
        tuition,
    }
}

fn fee_rows(db_path: &Path, student_id: &str) -> Vec<(i64, i64, String)> {
    let conn = rusqlite::Connection::open(db_path).expect("open db");
    let mut stmt = conn
        .prepare(
            "SELECT total_paid_cents, outstanding_cents, status
             FROM student_fees WHERE student_id = ? ORDER BY id",
        )
        .expect("prepare");
    let rows = stmt
        .query_map([student_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    rows
}

#[test]
fn payments_reduce_outstanding_and_rewrite_every_fee_row() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, "partial");
    let db_path = f.workspace.join("school.sqlite3");

    let activity = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "fs2",
            "fees.structures.create",
            json!({ "amount": 1000, "studentType": "day", "category": "Activity" }),
        ),
        "feeStructureId",
    );
    let billed = request_ok(
        &mut stdin,
        &mut reader,
        "bill",
        "fees.billClass",
        json!({ "classId": f.class_id, "feeStructureId": f.tuition }),
    );
    assert_eq!(billed["billed"].as_array().map(|b| b.len()), Some(1));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "bill-again",
        "fees.billClass",
        json!({ "classId": f.class_id, "feeStructureId": f.tuition }),
    );
    assert_eq!(again["skipped"].as_array().map(|b| b.len()), Some(1));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": activity }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 2000, "method": "cash", "paymentDate": "2026-01-10" }),
    );
    assert_eq!(first["payment"]["status"], "completed");
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 1500, "method": "mpesa" }),
    );

    let summary = &second["summary"];
    assert_eq!(summary["totalBilled"], 6000.0);
    assert_eq!(summary["totalPaid"], 3500.0);
    assert_eq!(summary["outstanding"], 2500.0);
    assert_eq!(summary["status"], "partial");

    // Global allocation: every row carries the full paid total.
    let tuition_row = summary["fees"]
        .as_array()
        .and_then(|rows| rows.iter().find(|r| r["feeStructureId"] == f.tuition.as_str()))
        .expect("tuition row");
    assert_eq!(tuition_row["totalPaid"], 3500.0);
    assert_eq!(tuition_row["outstanding"], 1500.0);
    assert_eq!(tuition_row["status"], "partial");

    let rows = fee_rows(&db_path, &f.student_id);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|(paid, _, _)| *paid == 350_000));
    assert!(rows.contains(&(350_000, 150_000, "partial".to_string())));
    assert!(rows.contains(&(350_000, -250_000, "paid".to_string())));

    let verified = request_ok(
        &mut stdin,
        &mut reader,
        "v",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(verified["consistent"], true);

    let balances = request_ok(
        &mut stdin,
        &mut reader,
        "bal",
        "reports.feeBalances",
        json!({ "classId": f.class_id }),
    );
    assert_eq!(balances["rows"][0]["outstanding"], 2500.0);
    assert_eq!(balances["totalPaid"], 3500.0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn verify_detects_a_tampered_cache_and_reconcile_repairs_it() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, "tamper");
    let db_path = f.workspace.join("school.sqlite3");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": f.tuition }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 2000, "method": "cash" }),
    );

    {
        let conn = rusqlite::Connection::open(&db_path).expect("open db");
        conn.execute(
            "UPDATE student_fees SET total_paid_cents = 0, outstanding_cents = 500000, status = 'unpaid'
             WHERE student_id = ?",
            [&f.student_id],
        )
        .expect("tamper");
    }

    let e = request_err(
        &mut stdin,
        &mut reader,
        "v1",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(e["code"], "reconciliation_inconsistent");
    assert_eq!(e["details"]["rows"].as_array().map(|r| r.len()), Some(1));
    assert_eq!(e["details"]["rows"][0]["ledgerPaid"], 2000.0);
    // Verify never repairs.
    assert_eq!(fee_rows(&db_path, &f.student_id)[0].0, 0);

    let repaired = request_ok(
        &mut stdin,
        &mut reader,
        "rec",
        "fees.reconcile",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(repaired["outstanding"], 3000.0);
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(200_000, 300_000, "partial".to_string())]
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unknown_statuses_are_reported_not_coerced() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, "bogus-status");
    let db_path = f.workspace.join("school.sqlite3");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": f.tuition }),
    );
    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 2000, "method": "cash" }),
    );
    let payment_id = str_field(&paid["payment"], "id");

    {
        let conn = rusqlite::Connection::open(&db_path).expect("open db");
        conn.execute(
            "UPDATE student_fees SET status = 'bogus' WHERE student_id = ?",
            [&f.student_id],
        )
        .expect("tamper");
    }
    let e = request_err(
        &mut stdin,
        &mut reader,
        "v1",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(e["code"], "reconciliation_inconsistent");
    assert_eq!(e["details"]["status"], "bogus");
    assert!(e["details"]["studentFeeId"].is_string());
    assert_eq!(fee_rows(&db_path, &f.student_id)[0].2, "bogus");

    // The cache is derived, so reconcile can rewrite it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "rec",
        "fees.reconcile",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(200_000, 300_000, "partial".to_string())]
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );

    // The ledger is the source of truth and is never guessed at.
    {
        let conn = rusqlite::Connection::open(&db_path).expect("open db");
        conn.execute(
            "UPDATE payments SET status = 'refunded' WHERE id = ?",
            [&payment_id],
        )
        .expect("tamper");
    }
    let e = request_err(
        &mut stdin,
        &mut reader,
        "v3",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(e["code"], "reconciliation_inconsistent");
    assert_eq!(e["details"]["paymentId"], payment_id.as_str());
    let e = request_err(
        &mut stdin,
        &mut reader,
        "rec-2",
        "fees.reconcile",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(e["code"], "reconciliation_inconsistent");
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(200_000, 300_000, "partial".to_string())]
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn switching_allocation_rewrites_existing_fee_rows() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, "switch");
    let db_path = f.workspace.join("school.sqlite3");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": f.tuition }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 2000, "method": "cash" }),
    );
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(200_000, 300_000, "partial".to_string())]
    );

    // The payment has no fee id, so per-fee allocation credits no row.
    let settings = request_ok(
        &mut stdin,
        &mut reader,
        "per-fee",
        "settings.update",
        json!({ "patch": { "feeAllocation": "per_fee" } }),
    );
    assert_eq!(settings["feeAllocation"], "per_fee");
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(0, 500_000, "unpaid".to_string())]
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "v1",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "global",
        "settings.update",
        json!({ "patch": { "feeAllocation": "global" } }),
    );
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(200_000, 300_000, "partial".to_string())]
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn concurrent_payments_from_two_daemons_all_land_in_the_cache() {
    const PAYMENTS_EACH: usize = 10;
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, "concurrent");
    let db_path = f.workspace.join("school.sqlite3");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": f.tuition }),
    );

    let workers: Vec<_> = (0..2)
        .map(|w| {
            let workspace = f.workspace.clone();
            let student_id = f.student_id.clone();
            std::thread::spawn(move || {
                let (mut child, mut stdin, mut reader) = spawn_sidecar();
                let _ = request_ok(
                    &mut stdin,
                    &mut reader,
                    "ws",
                    "workspace.select",
                    json!({ "path": workspace.to_string_lossy() }),
                );
                for i in 0..PAYMENTS_EACH {
                    let _ = request_ok(
                        &mut stdin,
                        &mut reader,
                        &format!("w{}-p{}", w, i),
                        "payments.record",
                        json!({ "studentId": student_id, "amountPaid": 100, "method": "mpesa" }),
                    );
                }
                drop(stdin);
                let _ = child.wait();
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let ledger_cents: i64 = {
        let conn = rusqlite::Connection::open(&db_path).expect("open db");
        conn.query_row(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM payments WHERE student_id = ?",
            [&f.student_id],
            |r| r.get(0),
        )
        .expect("sum")
    };
    assert_eq!(ledger_cents, 2 * PAYMENTS_EACH as i64 * 10_000);
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(ledger_cents, 500_000 - ledger_cents, "partial".to_string())]
    );
    let verified = request_ok(
        &mut stdin,
        &mut reader,
        "v",
        "fees.verify",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(verified["consistent"], true);
    assert_eq!(verified["summary"]["totalPaid"], 2000.0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn rejected_payments_write_nothing_and_pending_ones_do_not_count() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, "reject");
    let db_path = f.workspace.join("school.sqlite3");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": f.tuition }),
    );

    let zero = request_err(
        &mut stdin,
        &mut reader,
        "z",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 0, "method": "cash" }),
    );
    assert_eq!(zero["code"], "bad_input");
    let fractional = request_err(
        &mut stdin,
        &mut reader,
        "f",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 10.005, "method": "cash" }),
    );
    assert_eq!(fractional["code"], "bad_input");
    let foreign_fee = request_err(
        &mut stdin,
        &mut reader,
        "ff",
        "payments.record",
        json!({ "studentId": f.student_id, "feeId": "not-a-fee", "amountPaid": 100, "method": "cash" }),
    );
    assert_eq!(foreign_fee["code"], "not_found");
    let unknown_student = request_err(
        &mut stdin,
        &mut reader,
        "us",
        "payments.record",
        json!({ "studentId": "ghost", "amountPaid": 100, "method": "cash" }),
    );
    assert_eq!(unknown_student["code"], "not_found");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "payments.list",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(listed["payments"].as_array().map(|p| p.len()), Some(0));
    assert_eq!(
        fee_rows(&db_path, &f.student_id),
        vec![(0, 500_000, "unpaid".to_string())]
    );

    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "pend",
        "payments.record",
        json!({ "studentId": f.student_id, "amountPaid": 1000, "method": "cheque", "status": "pending" }),
    );
    assert_eq!(pending["summary"]["totalPaid"], 0.0);
    assert_eq!(pending["summary"]["status"], "unpaid");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l2",
        "payments.list",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(listed["payments"].as_array().map(|p| p.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn per_fee_allocation_only_counts_payments_against_their_row() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, "perfee");

    let transport = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "fs2",
            "fees.structures.create",
            json!({ "amount": 800, "studentType": "day", "category": "Transport" }),
        ),
        "feeStructureId",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "set",
        "settings.update",
        json!({ "patch": { "feeAllocation": "per_fee" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": f.tuition }),
    );
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": transport }),
    );
    let transport_row_id = assigned["summary"]["fees"]
        .as_array()
        .and_then(|rows| rows.iter().find(|r| r["feeStructureId"] == transport.as_str()))
        .and_then(|r| r["id"].as_str())
        .expect("transport row")
        .to_string();

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "p",
        "payments.record",
        json!({ "studentId": f.student_id, "feeId": transport_row_id, "amountPaid": 800, "method": "bank" }),
    );
    let rows = paid["summary"]["fees"].as_array().expect("fees");
    for row in rows {
        if row["id"] == transport_row_id.as_str() {
            assert_eq!(row["status"], "paid");
        } else {
            assert_eq!(row["totalPaid"], 0.0);
            assert_eq!(row["status"], "unpaid");
        }
    }
    assert_eq!(paid["summary"]["outstanding"], 5000.0);

    let dup = request_err(
        &mut stdin,
        &mut reader,
        "dup",
        "fees.assign",
        json!({ "studentId": f.student_id, "feeStructureId": transport }),
    );
    assert_eq!(dup["code"], "bad_input");

    drop(stdin);
    let _ = child.wait();
}
