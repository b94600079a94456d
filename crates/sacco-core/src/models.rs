use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Entity class an administrative action points at. Legacy rows may carry
/// target strings this build no longer produces; those load as `Unknown`
/// and are skipped at dispatch instead of failing the vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionTarget {
    Member,
    Loan,
    PaymentTransaction,
    Unknown(String),
}

impl ActionTarget {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Member => "member",
            Self::Loan => "loan",
            Self::PaymentTransaction => "payment_transaction",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "member" | "user" => Self::Member,
            "loan" => Self::Loan,
            "payment_transaction" => Self::PaymentTransaction,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Closed set of admin action payloads, one variant per sensitive
/// mutation. Validated against the target at initiation, so execution
/// never has to interpret free-form JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminActionKind {
    SetMemberActive { active: bool },
    DecideLoan { approve: bool, approved_amount: Option<Decimal> },
    CompletePayment { reference: String },
}

impl AdminActionKind {
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::SetMemberActive { .. } => "set_member_active",
            Self::DecideLoan { .. } => "decide_loan",
            Self::CompletePayment { .. } => "complete_payment",
        }
    }

    pub fn target(&self) -> ActionTarget {
        match self {
            Self::SetMemberActive { .. } => ActionTarget::Member,
            Self::DecideLoan { .. } => ActionTarget::Loan,
            Self::CompletePayment { .. } => ActionTarget::PaymentTransaction,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAction {
    pub id: Uuid,
    pub initiated_by: Uuid,
    pub action_type: String,
    pub target: ActionTarget,
    pub entity_id: Uuid,
    pub reason: String,
    /// None when the stored payload no longer parses (legacy data).
    pub kind: Option<AdminActionKind>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminVerification {
    pub id: Uuid,
    pub action_id: Uuid,
    pub verifier_id: Uuid,
    pub decision: ApprovalDecision,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VoteTally {
    pub approvals: i64,
    pub rejections: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub id: Uuid,
    pub name: String,
    pub entity_type: String,
    /// Inclusive band bounds; `None` leaves that end open.
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub is_default: bool,
    pub active: bool,
}

impl ApprovalWorkflow {
    pub fn covers(&self, amount: Decimal) -> bool {
        let above_min = self.min_amount.map_or(true, |min| amount >= min);
        let below_max = self.max_amount.map_or(true, |max| amount <= max);
        above_min && below_max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_order: i32,
    pub name: String,
    pub role: String,
    pub approvers_required: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalHistoryEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub approver_id: Uuid,
    pub decision: ApprovalDecision,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Pending,
    Approved,
    Active,
    Paid,
    Rejected,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Active => "active",
            Self::Paid => "paid",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "active" => Some(Self::Active),
            "paid" => Some(Self::Paid),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub requested_amount: Decimal,
    pub approved_amount: Option<Decimal>,
    /// Flat monthly interest rate in percent.
    pub interest_rate: Decimal,
    pub repayment_months: i32,
    pub balance_remaining: Decimal,
    pub status: LoanStatus,
    pub workflow_id: Option<Uuid>,
    pub current_step_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Loan {
    /// Multiplier baked into the outstanding balance at approval time:
    /// `1 + rate/100 * months`. Repayments divide by this to recover the
    /// principal portion of a payment.
    pub fn interest_factor(&self) -> Decimal {
        Decimal::ONE + self.interest_rate / Decimal::ONE_HUNDRED * Decimal::from(self.repayment_months)
    }

    /// Balance owed once a principal amount is approved.
    pub fn balance_with_interest(&self, principal: Decimal) -> Decimal {
        (principal * self.interest_factor()).round_dp(2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanRepayment {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub amount: Decimal,
    pub principal: Decimal,
    pub interest: Decimal,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuarantorStatus {
    Pending,
    Accepted,
    Declined,
    Released,
}

impl GuarantorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            "released" => Some(Self::Released),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanGuarantor {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub guarantor_id: Uuid,
    pub shares_pledged: i32,
    pub amount_covered: Decimal,
    pub status: GuarantorStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub member_id: Uuid,
    pub amount: Decimal,
    pub kind: String,
    /// Gateway checkout reference; the allocation idempotency key.
    pub reference: String,
    pub status: TransactionStatus,
    pub allocation: Option<AllocationBreakdown>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelfarePayment {
    pub id: Uuid,
    pub member_id: Uuid,
    pub amount: Decimal,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharePurchase {
    pub id: Uuid,
    pub member_id: Uuid,
    pub quantity: i32,
    pub amount_paid: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsDeposit {
    pub id: Uuid,
    pub member_id: Uuid,
    pub amount: Decimal,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Cooperative income ledger row. Loan interest lands here, never in the
/// borrower's personal savings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeEntry {
    pub id: Uuid,
    pub amount: Decimal,
    pub source: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AllocationBreakdown {
    pub loan_principal: Decimal,
    pub loan_interest: Decimal,
    pub welfare: Decimal,
    pub shares: Decimal,
    pub savings: Decimal,
}

impl AllocationBreakdown {
    pub fn loan(&self) -> Decimal {
        self.loan_principal + self.loan_interest
    }

    pub fn total(&self) -> Decimal {
        self.loan() + self.welfare + self.shares + self.savings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn loan(rate: Decimal, months: i32) -> Loan {
        Loan {
            id: Uuid::new_v4(),
            borrower_id: Uuid::new_v4(),
            requested_amount: dec!(10000),
            approved_amount: None,
            interest_rate: rate,
            repayment_months: months,
            balance_remaining: Decimal::ZERO,
            status: LoanStatus::Pending,
            workflow_id: None,
            current_step_id: None,
            created_at: Utc::now(),
            approved_at: None,
        }
    }

    #[test]
    fn balance_bakes_flat_interest_at_approval() {
        let short = loan(dec!(3), 1);
        assert_eq!(short.interest_factor(), dec!(1.03));
        assert_eq!(short.balance_with_interest(dec!(10000)), dec!(10300.00));

        let longer = loan(dec!(1), 6);
        assert_eq!(longer.balance_with_interest(dec!(50000)), dec!(53000.00));
    }

    #[test]
    fn workflow_band_bounds_are_inclusive_and_open_ended() {
        let workflow = ApprovalWorkflow {
            id: Uuid::new_v4(),
            name: "standard".to_string(),
            entity_type: "loan".to_string(),
            min_amount: Some(dec!(50000)),
            max_amount: Some(dec!(200000)),
            is_default: false,
            active: true,
        };
        assert!(workflow.covers(dec!(50000)));
        assert!(workflow.covers(dec!(200000)));
        assert!(!workflow.covers(dec!(200000.01)));

        let open = ApprovalWorkflow {
            min_amount: None,
            max_amount: None,
            ..workflow
        };
        assert!(open.covers(dec!(1)));
        assert!(open.covers(dec!(10000000)));
    }

    #[test]
    fn action_targets_round_trip_and_tolerate_legacy_values() {
        assert_eq!(ActionTarget::parse("loan"), ActionTarget::Loan);
        assert_eq!(ActionTarget::parse("user"), ActionTarget::Member);
        assert_eq!(
            ActionTarget::parse("document"),
            ActionTarget::Unknown("document".to_string())
        );
    }

    #[test]
    fn breakdown_totals_all_buckets() {
        let breakdown = AllocationBreakdown {
            loan_principal: dec!(10000),
            loan_interest: dec!(300),
            welfare: dec!(300),
            shares: dec!(9000),
            savings: dec!(400),
        };
        assert_eq!(breakdown.loan(), dec!(10300));
        assert_eq!(breakdown.total(), dec!(20000));
    }
}
