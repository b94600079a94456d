use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sacco_core::models::{AdminActionKind, AllocationBreakdown};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActionRequest {
    pub initiated_by: Uuid,
    pub entity_id: Uuid,
    pub reason: String,
    #[serde(flatten)]
    pub action: AdminActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActionResponse {
    pub action_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyActionRequest {
    pub verifier_id: Uuid,
    pub decision: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyActionResponse {
    pub action_id: Uuid,
    pub status: String,
    pub approvals: i64,
    pub rejections: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLoanRequest {
    pub borrower_id: Uuid,
    pub amount: Decimal,
    pub repayment_months: i32,
    /// Flat monthly rate in percent; omitted means the cooperative default.
    pub interest_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLoanResponse {
    pub loan_id: Uuid,
    pub status: String,
    pub workflow: String,
    pub current_step: String,
    pub total_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideLoanRequest {
    pub approver_id: Uuid,
    pub decision: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideLoanResponse {
    pub loan_id: Uuid,
    pub status: String,
    pub approvals: Option<i64>,
    pub required: Option<i32>,
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePaymentRequest {
    pub member_id: Uuid,
    pub phone: String,
    pub amount: Decimal,
    #[serde(default = "default_payment_kind")]
    pub kind: String,
}

fn default_payment_kind() -> String {
    "contribution".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePaymentResponse {
    pub transaction_id: Uuid,
    pub reference: String,
    pub status: String,
}

/// Provider callback after an STK push resolves. Redelivered callbacks
/// are expected and settle at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCallbackRequest {
    pub reference: String,
    pub member_id: Uuid,
    pub amount: Decimal,
    pub success: bool,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCallbackResponse {
    pub reference: String,
    pub status: String,
    pub allocation: Option<AllocationBreakdown>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStatusResponse {
    pub reference: String,
    pub status: String,
    pub amount: Decimal,
    pub allocation: Option<AllocationBreakdown>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSummaryResponse {
    pub member_id: Uuid,
    pub outstanding_loans: Decimal,
    pub active_loan_count: usize,
    pub shares_held: i64,
    pub share_value: Decimal,
    pub savings_total: Decimal,
    pub has_minimum_shares: bool,
}

/// Command queued for the mobile-money worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkPushCommand {
    pub checkout_reference: String,
    pub phone: String,
    pub amount: Decimal,
    pub account_reference: String,
    pub requested_at: DateTime<Utc>,
}
