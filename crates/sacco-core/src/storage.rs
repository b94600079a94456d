use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::models::{
    AdminAction, AdminVerification, AllocationBreakdown, ApprovalHistoryEntry, ApprovalWorkflow,
    IncomeEntry, Loan, LoanRepayment, LoanStatus, PaymentTransaction, SavingsDeposit,
    SharePurchase, VoteTally, WelfarePayment, WorkflowStep,
};

/// Read surface plus the entry point for a unit of work. Every engine
/// mutation runs through a [`StoreTx`] so a mid-flight failure rolls the
/// whole operation back, and tests can swap in the in-memory store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx + '_>, CoreError>;

    async fn action(&self, id: Uuid) -> Result<Option<AdminAction>, CoreError>;
    async fn loan(&self, id: Uuid) -> Result<Option<Loan>, CoreError>;
    async fn workflow(&self, id: Uuid) -> Result<Option<ApprovalWorkflow>, CoreError>;
    async fn workflow_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, CoreError>;
    async fn step_approvals(&self, loan_id: Uuid, step_id: Uuid) -> Result<i64, CoreError>;
    async fn approval_history(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<ApprovalHistoryEntry>, CoreError>;
    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, CoreError>;
    async fn active_loans(&self, member_id: Uuid) -> Result<Vec<Loan>, CoreError>;
    async fn shares_held(&self, member_id: Uuid) -> Result<i64, CoreError>;
    async fn savings_total(&self, member_id: Uuid) -> Result<Decimal, CoreError>;
}

/// One transaction. Dropping an uncommitted transaction discards every
/// write it staged.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self: Box<Self>) -> Result<(), CoreError>;

    // Consensus actions. `action_for_update` takes the row lock that
    // serializes concurrent voters on the same action.
    async fn insert_action(&mut self, action: &AdminAction) -> Result<(), CoreError>;
    async fn action_for_update(&mut self, id: Uuid) -> Result<Option<AdminAction>, CoreError>;
    async fn has_verified(
        &mut self,
        action_id: Uuid,
        verifier_id: Uuid,
    ) -> Result<bool, CoreError>;
    async fn insert_verification(
        &mut self,
        verification: &AdminVerification,
    ) -> Result<(), CoreError>;
    async fn verification_tally(&mut self, action_id: Uuid) -> Result<VoteTally, CoreError>;
    async fn set_action_status(
        &mut self,
        id: Uuid,
        status: crate::models::ActionStatus,
    ) -> Result<(), CoreError>;
    async fn set_member_active(&mut self, member_id: Uuid, active: bool)
    -> Result<(), CoreError>;

    // Loans and workflow routing.
    async fn insert_loan(&mut self, loan: &Loan) -> Result<(), CoreError>;
    async fn loan_for_update(&mut self, id: Uuid) -> Result<Option<Loan>, CoreError>;
    async fn set_loan_route(
        &mut self,
        loan_id: Uuid,
        workflow_id: Option<Uuid>,
        step_id: Option<Uuid>,
    ) -> Result<(), CoreError>;
    async fn set_loan_status(&mut self, loan_id: Uuid, status: LoanStatus)
    -> Result<(), CoreError>;
    async fn approve_loan(
        &mut self,
        loan_id: Uuid,
        approved_amount: Decimal,
        balance_remaining: Decimal,
    ) -> Result<(), CoreError>;
    async fn active_workflows(
        &mut self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalWorkflow>, CoreError>;
    async fn workflow_steps(&mut self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, CoreError>;
    async fn insert_history(&mut self, entry: &ApprovalHistoryEntry) -> Result<(), CoreError>;
    async fn step_approvals(&mut self, loan_id: Uuid, step_id: Uuid) -> Result<i64, CoreError>;
    async fn has_approved_step(
        &mut self,
        loan_id: Uuid,
        step_id: Uuid,
        approver_id: Uuid,
    ) -> Result<bool, CoreError>;

    // Settlement and allocation.
    async fn insert_transaction(
        &mut self,
        transaction: &PaymentTransaction,
    ) -> Result<(), CoreError>;
    /// Conditional pending -> completed flip; returns the transaction only
    /// for the caller that won the update.
    async fn settle_transaction(
        &mut self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, CoreError>;
    async fn fail_transaction(&mut self, reference: &str) -> Result<bool, CoreError>;
    async fn record_allocation(
        &mut self,
        reference: &str,
        breakdown: &AllocationBreakdown,
    ) -> Result<(), CoreError>;
    async fn active_loans(&mut self, member_id: Uuid) -> Result<Vec<Loan>, CoreError>;
    /// Single-statement balance decrement; returns the new balance.
    async fn apply_repayment(&mut self, loan_id: Uuid, amount: Decimal)
    -> Result<Decimal, CoreError>;
    async fn insert_repayment(&mut self, repayment: &LoanRepayment) -> Result<(), CoreError>;
    async fn mark_loan_paid(&mut self, loan_id: Uuid) -> Result<(), CoreError>;
    /// Accepted guarantors on the loan move to released; returns how many.
    async fn release_guarantors(&mut self, loan_id: Uuid) -> Result<u64, CoreError>;
    async fn insert_income(&mut self, entry: &IncomeEntry) -> Result<(), CoreError>;
    async fn insert_welfare_payment(&mut self, payment: &WelfarePayment)
    -> Result<(), CoreError>;
    async fn shares_held(&mut self, member_id: Uuid) -> Result<i64, CoreError>;
    async fn insert_share_purchase(&mut self, purchase: &SharePurchase)
    -> Result<(), CoreError>;
    async fn insert_savings_deposit(
        &mut self,
        deposit: &SavingsDeposit,
    ) -> Result<(), CoreError>;
}
