use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::store;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Serialize, Serializer};
use serde_json::json;
use std::ops::{Add, Sub};
use uuid::Uuid;

/// Money in minor units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    /// Parses a decimal amount with at most two fraction digits.
    pub fn from_units(v: f64) -> Result<Self> {
        if !v.is_finite() {
            return Err(EngineError::input("amount must be a finite number"));
        }
        let cents = (v * 100.0).round();
        if (cents - v * 100.0).abs() > 1e-6 {
            return Err(EngineError::input(format!(
                "amount {} has more than two decimal places",
                v
            )));
        }
        if cents.abs() > 9.0e15 {
            return Err(EngineError::input("amount is too large"));
        }
        Ok(Money(cents as i64))
    }

    pub fn as_units(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |a, b| a + b)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_f64(self.as_units())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    Paid,
    Partial,
    Unpaid,
}

impl FeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeeStatus::Paid => "paid",
            FeeStatus::Partial => "partial",
            FeeStatus::Unpaid => "unpaid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paid" => Some(FeeStatus::Paid),
            "partial" => Some(FeeStatus::Partial),
            "unpaid" => Some(FeeStatus::Unpaid),
            _ => None,
        }
    }

    pub fn from_totals(paid: Money, outstanding: Money) -> Self {
        if outstanding <= Money::ZERO {
            FeeStatus::Paid
        } else if paid > Money::ZERO {
            FeeStatus::Partial
        } else {
            FeeStatus::Unpaid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "completed" => Some(PaymentStatus::Completed),
            "pending" => Some(PaymentStatus::Pending),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

/// How ledger payments are counted against individual fee rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeAllocation {
    /// Every fee row is reduced by the student's total paid.
    Global,
    /// A fee row only counts payments whose fee_id references it.
    PerFee,
}

impl FeeAllocation {
    pub fn as_str(self) -> &'static str {
        match self {
            FeeAllocation::Global => "global",
            FeeAllocation::PerFee => "per_fee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(FeeAllocation::Global),
            "per_fee" => Some(FeeAllocation::PerFee),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeStructure {
    pub id: String,
    pub amount: Money,
    pub student_type: String,
    pub term: Option<i64>,
    pub academic_year: Option<String>,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFee {
    pub id: String,
    pub student_id: String,
    pub fee_structure_id: String,
    pub total_billed: Money,
    pub total_paid: Money,
    pub outstanding: Money,
    pub status: FeeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub student_id: String,
    pub fee_id: Option<String>,
    pub amount_paid: Money,
    pub payment_date: String,
    pub method: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSummary {
    pub student_id: String,
    pub total_billed: Money,
    pub total_paid: Money,
    pub outstanding: Money,
    pub status: FeeStatus,
    pub fees: Vec<StudentFee>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub student_id: String,
    pub fee_id: Option<String>,
    pub amount_paid: Money,
    pub payment_date: Option<String>,
    pub method: String,
    pub status: PaymentStatus,
}

/// Recomputes a student's fee aggregates from billed rows and the ledger.
/// Cached paid/outstanding/status values on `fees` are ignored.
pub fn reconcile_fees(
    student_id: &str,
    fees: &[StudentFee],
    payments: &[Payment],
    allocation: FeeAllocation,
) -> FeeSummary {
    let counted: Vec<&Payment> = payments
        .iter()
        .filter(|p| p.student_id == student_id && p.status == PaymentStatus::Completed)
        .collect();
    let total_paid: Money = counted.iter().map(|p| p.amount_paid).sum();

    let rows: Vec<StudentFee> = fees
        .iter()
        .filter(|f| f.student_id == student_id)
        .map(|f| {
            let paid = match allocation {
                FeeAllocation::Global => total_paid,
                FeeAllocation::PerFee => counted
                    .iter()
                    .filter(|p| p.fee_id.as_deref() == Some(f.id.as_str()))
                    .map(|p| p.amount_paid)
                    .sum(),
            };
            let outstanding = f.total_billed - paid;
            StudentFee {
                total_paid: paid,
                outstanding,
                status: FeeStatus::from_totals(paid, outstanding),
                ..f.clone()
            }
        })
        .collect();

    let total_billed: Money = rows.iter().map(|f| f.total_billed).sum();
    let outstanding = total_billed - total_paid;
    FeeSummary {
        student_id: student_id.to_string(),
        total_billed,
        total_paid,
        outstanding,
        status: FeeStatus::from_totals(total_paid, outstanding),
        fees: rows,
    }
}

fn compute(conn: &Connection, student_id: &str, allocation: FeeAllocation) -> Result<FeeSummary> {
    if store::student(conn, student_id)?.is_none() {
        return Err(EngineError::NotFound("student"));
    }
    let fees = store::fetch_fee_bills(conn, student_id)?;
    let payments = store::fetch_payments(conn, student_id)?;
    Ok(reconcile_fees(student_id, &fees, &payments, allocation))
}

fn write_all(conn: &Connection, summary: &FeeSummary) -> Result<()> {
    for row in &summary.fees {
        let touched = store::write_student_fee(conn, row)?;
        if touched != 1 {
            return Err(EngineError::Consistency {
                message: "fee cache update did not reach every fee row".to_string(),
                details: json!({
                    "studentId": summary.student_id,
                    "studentFeeId": row.id,
                    "rowsTouched": touched,
                }),
            });
        }
    }
    Ok(())
}

/// Recomputes and rewrites every StudentFee row for the student.
pub fn reconcile(
    conn: &mut Connection,
    student_id: &str,
    allocation: FeeAllocation,
) -> Result<FeeSummary> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let summary = compute(&tx, student_id, allocation)?;
    write_all(&tx, &summary)?;
    tx.commit()?;
    Ok(summary)
}

/// Read-only check that the cached rows match the ledger. A mismatch is
/// reported, never repaired here.
pub fn verify(conn: &Connection, student_id: &str, allocation: FeeAllocation) -> Result<FeeSummary> {
    let tx = conn.unchecked_transaction()?;
    let cached = store::fetch_student_fees(&tx, student_id)?;
    let summary = compute(&tx, student_id, allocation)?;
    tx.commit()?;

    let mismatches: Vec<serde_json::Value> = summary
        .fees
        .iter()
        .zip(cached.iter())
        .filter(|(fresh, old)| **fresh != **old)
        .map(|(fresh, old)| {
            json!({
                "studentFeeId": fresh.id,
                "cachedPaid": old.total_paid,
                "ledgerPaid": fresh.total_paid,
                "cachedOutstanding": old.outstanding,
                "ledgerOutstanding": fresh.outstanding,
                "cachedStatus": old.status,
                "ledgerStatus": fresh.status,
            })
        })
        .collect();
    if !mismatches.is_empty() {
        tracing::warn!(
            student_id,
            rows = mismatches.len(),
            "fee cache disagrees with payment ledger"
        );
        return Err(EngineError::Consistency {
            message: "cached fee totals do not match the payment ledger".to_string(),
            details: json!({ "studentId": student_id, "rows": mismatches }),
        });
    }
    Ok(summary)
}

fn check_new_payment(conn: &Connection, p: &NewPayment) -> Result<()> {
    if p.amount_paid <= Money::ZERO {
        return Err(EngineError::input("amountPaid must be > 0"));
    }
    if p.method.trim().is_empty() {
        return Err(EngineError::input("method must not be empty"));
    }
    if store::student(conn, &p.student_id)?.is_none() {
        return Err(EngineError::NotFound("student"));
    }
    if let Some(fee_id) = &p.fee_id {
        let owned = store::fetch_fee_bills(conn, &p.student_id)?
            .iter()
            .any(|f| &f.id == fee_id);
        if !owned {
            return Err(EngineError::NotFound("student fee"));
        }
    }
    Ok(())
}

/// Appends a payment and rewrites every fee row of the student in one
/// IMMEDIATE transaction. Nothing is written unless all of it succeeds.
pub fn record_payment(
    conn: &mut Connection,
    new: NewPayment,
    allocation: FeeAllocation,
) -> Result<(Payment, FeeSummary)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    check_new_payment(&tx, &new)?;

    let payment = Payment {
        id: Uuid::new_v4().to_string(),
        student_id: new.student_id,
        fee_id: new.fee_id,
        amount_paid: new.amount_paid,
        payment_date: new
            .payment_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive().to_string()),
        method: new.method.trim().to_string(),
        status: new.status,
    };
    store::insert_payment(&tx, &payment)?;

    let summary = compute(&tx, &payment.student_id, allocation)?;
    write_all(&tx, &summary)?;
    tx.commit()?;

    tracing::info!(
        student_id = %payment.student_id,
        amount_cents = payment.amount_paid.cents(),
        status = payment.status.as_str(),
        outstanding_cents = summary.outstanding.cents(),
        "payment recorded"
    );
    Ok((payment, summary))
}

fn assign_in_tx(
    conn: &Connection,
    student_id: &str,
    structure: &FeeStructure,
) -> Result<bool> {
    let already = store::fetch_fee_bills(conn, student_id)?
        .iter()
        .any(|f| f.fee_structure_id == structure.id);
    if already {
        return Ok(false);
    }
    store::insert_student_fee(
        conn,
        &StudentFee {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            fee_structure_id: structure.id.clone(),
            total_billed: structure.amount,
            total_paid: Money::ZERO,
            outstanding: structure.amount,
            status: FeeStatus::Unpaid,
        },
    )?;
    Ok(true)
}

/// Bills one fee structure to one student and reconciles the new row
/// against the existing ledger.
pub fn assign_fee(
    conn: &mut Connection,
    student_id: &str,
    fee_structure_id: &str,
    allocation: FeeAllocation,
) -> Result<FeeSummary> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if store::student(&tx, student_id)?.is_none() {
        return Err(EngineError::NotFound("student"));
    }
    let structure = store::fee_structure(&tx, fee_structure_id)?
        .ok_or(EngineError::NotFound("fee structure"))?;
    if !assign_in_tx(&tx, student_id, &structure)? {
        return Err(EngineError::input(
            "fee structure is already billed to this student",
        ));
    }
    let summary = compute(&tx, student_id, allocation)?;
    write_all(&tx, &summary)?;
    tx.commit()?;
    Ok(summary)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingOutcome {
    pub billed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Bills a structure to every active student of the class with a matching
/// student type. Students already billed are skipped.
pub fn bill_class(
    conn: &mut Connection,
    class_id: &str,
    fee_structure_id: &str,
    allocation: FeeAllocation,
) -> Result<BillingOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !store::class_exists(&tx, class_id)? {
        return Err(EngineError::NotFound("class"));
    }
    let structure = store::fee_structure(&tx, fee_structure_id)?
        .ok_or(EngineError::NotFound("fee structure"))?;

    let mut out = BillingOutcome::default();
    for s in store::students_for_class(&tx, class_id)? {
        if !s.active || !s.student_type.eq_ignore_ascii_case(&structure.student_type) {
            continue;
        }
        if assign_in_tx(&tx, &s.id, &structure)? {
            let summary = compute(&tx, &s.id, allocation)?;
            write_all(&tx, &summary)?;
            out.billed.push(s.id);
        } else {
            out.skipped.push(s.id);
        }
    }
    tx.commit()?;
    tracing::info!(
        class_id,
        fee_structure_id,
        billed = out.billed.len(),
        skipped = out.skipped.len(),
        "class billed"
    );
    Ok(out)
}

/// Persists `next` and, when the allocation policy changed, rewrites the fee
/// rows of every billed student under the new policy. Settings and fee rows
/// commit together in one IMMEDIATE transaction. Returns the number of
/// students whose rows were rewritten.
pub fn save_config(
    conn: &mut Connection,
    previous: &EngineConfig,
    next: &EngineConfig,
) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    next.save(&tx)?;
    let mut rewritten = 0;
    if previous.fee_allocation != next.fee_allocation {
        for student_id in store::students_with_fees(&tx)? {
            let summary = compute(&tx, &student_id, next.fee_allocation)?;
            write_all(&tx, &summary)?;
            rewritten += 1;
        }
    }
    tx.commit()?;
    if rewritten > 0 {
        tracing::info!(
            allocation = next.fee_allocation.as_str(),
            students = rewritten,
            "fee rows rewritten for new allocation"
        );
    }
    Ok(rewritten)
}
