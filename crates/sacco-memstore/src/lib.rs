use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use sacco_core::errors::CoreError;
use sacco_core::external::{Notice, Notifier, RoleDirectory};
use sacco_core::models::{
    ActionStatus, AdminAction, AdminVerification, AllocationBreakdown, ApprovalDecision,
    ApprovalHistoryEntry, ApprovalWorkflow, GuarantorStatus, IncomeEntry, Loan, LoanGuarantor,
    LoanRepayment, LoanStatus, Member, PaymentTransaction, SavingsDeposit, SharePurchase,
    TransactionStatus, VoteTally, WelfarePayment, WorkflowStep,
};
use sacco_core::storage::{Store, StoreTx};

#[derive(Default, Clone)]
struct MemState {
    members: HashMap<Uuid, Member>,
    actions: HashMap<Uuid, AdminAction>,
    verifications: Vec<AdminVerification>,
    workflows: HashMap<Uuid, ApprovalWorkflow>,
    steps: HashMap<Uuid, WorkflowStep>,
    loans: HashMap<Uuid, Loan>,
    history: Vec<ApprovalHistoryEntry>,
    transactions: HashMap<String, PaymentTransaction>,
    guarantors: HashMap<Uuid, LoanGuarantor>,
    repayments: Vec<LoanRepayment>,
    welfare: Vec<WelfarePayment>,
    shares: Vec<SharePurchase>,
    savings: Vec<SavingsDeposit>,
    income: Vec<IncomeEntry>,
}

impl MemState {
    fn active_loans(&self, member_id: Uuid) -> Vec<Loan> {
        let mut loans: Vec<Loan> = self
            .loans
            .values()
            .filter(|loan| loan.borrower_id == member_id && loan.status == LoanStatus::Active)
            .cloned()
            .collect();
        loans.sort_by_key(|loan| loan.created_at);
        loans
    }

    fn shares_held(&self, member_id: Uuid) -> i64 {
        self.shares
            .iter()
            .filter(|purchase| purchase.member_id == member_id)
            .map(|purchase| i64::from(purchase.quantity))
            .sum()
    }

    fn workflow_steps(&self, workflow_id: Uuid) -> Vec<WorkflowStep> {
        let mut steps: Vec<WorkflowStep> = self
            .steps
            .values()
            .filter(|step| step.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.step_order);
        steps
    }

    fn step_approvals(&self, loan_id: Uuid, step_id: Uuid) -> i64 {
        self.history
            .iter()
            .filter(|entry| {
                entry.entity_id == loan_id
                    && entry.step_id == step_id
                    && entry.decision == ApprovalDecision::Approved
            })
            .count() as i64
    }
}

/// In-memory [`Store`] with real transaction semantics: `begin` takes the
/// store lock and stages a copy of the state, `commit` writes it back.
/// Dropping an uncommitted transaction discards the staged writes.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for wiring up fixtures.

    pub async fn seed_member(&self, member: Member) {
        self.state.lock().await.members.insert(member.id, member);
    }

    pub async fn seed_workflow(&self, workflow: ApprovalWorkflow, steps: Vec<WorkflowStep>) {
        let mut state = self.state.lock().await;
        state.workflows.insert(workflow.id, workflow);
        for step in steps {
            state.steps.insert(step.id, step);
        }
    }

    pub async fn seed_loan(&self, loan: Loan) {
        self.state.lock().await.loans.insert(loan.id, loan);
    }

    pub async fn seed_guarantor(&self, guarantor: LoanGuarantor) {
        self.state
            .lock()
            .await
            .guarantors
            .insert(guarantor.id, guarantor);
    }

    pub async fn seed_transaction(&self, transaction: PaymentTransaction) {
        self.state
            .lock()
            .await
            .transactions
            .insert(transaction.reference.clone(), transaction);
    }

    pub async fn seed_action(&self, action: AdminAction) {
        self.state.lock().await.actions.insert(action.id, action);
    }

    pub async fn seed_share_purchase(&self, purchase: SharePurchase) {
        self.state.lock().await.shares.push(purchase);
    }

    // Inspection helpers for assertions.

    pub async fn member(&self, id: Uuid) -> Option<Member> {
        self.state.lock().await.members.get(&id).cloned()
    }

    pub async fn guarantors_for(&self, loan_id: Uuid) -> Vec<LoanGuarantor> {
        self.state
            .lock()
            .await
            .guarantors
            .values()
            .filter(|guarantor| guarantor.loan_id == loan_id)
            .cloned()
            .collect()
    }

    pub async fn repayments_for(&self, loan_id: Uuid) -> Vec<LoanRepayment> {
        self.state
            .lock()
            .await
            .repayments
            .iter()
            .filter(|repayment| repayment.loan_id == loan_id)
            .cloned()
            .collect()
    }

    pub async fn income_total(&self) -> Decimal {
        self.state
            .lock()
            .await
            .income
            .iter()
            .map(|entry| entry.amount)
            .sum()
    }

    pub async fn welfare_for(&self, member_id: Uuid) -> Vec<WelfarePayment> {
        self.state
            .lock()
            .await
            .welfare
            .iter()
            .filter(|payment| payment.member_id == member_id)
            .cloned()
            .collect()
    }

    pub async fn verifications_for(&self, action_id: Uuid) -> Vec<AdminVerification> {
        self.state
            .lock()
            .await
            .verifications
            .iter()
            .filter(|verification| verification.action_id == action_id)
            .cloned()
            .collect()
    }
}

pub struct MemTx {
    guard: OwnedMutexGuard<MemState>,
    staged: MemState,
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx + '_>, CoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemTx { guard, staged }))
    }

    async fn action(&self, id: Uuid) -> Result<Option<AdminAction>, CoreError> {
        Ok(self.state.lock().await.actions.get(&id).cloned())
    }

    async fn loan(&self, id: Uuid) -> Result<Option<Loan>, CoreError> {
        Ok(self.state.lock().await.loans.get(&id).cloned())
    }

    async fn workflow(&self, id: Uuid) -> Result<Option<ApprovalWorkflow>, CoreError> {
        Ok(self.state.lock().await.workflows.get(&id).cloned())
    }

    async fn workflow_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, CoreError> {
        Ok(self.state.lock().await.workflow_steps(workflow_id))
    }

    async fn step_approvals(&self, loan_id: Uuid, step_id: Uuid) -> Result<i64, CoreError> {
        Ok(self.state.lock().await.step_approvals(loan_id, step_id))
    }

    async fn approval_history(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<ApprovalHistoryEntry>, CoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<ApprovalHistoryEntry> = state
            .history
            .iter()
            .filter(|entry| entry.entity_id == entity_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, CoreError> {
        Ok(self.state.lock().await.transactions.get(reference).cloned())
    }

    async fn active_loans(&self, member_id: Uuid) -> Result<Vec<Loan>, CoreError> {
        Ok(self.state.lock().await.active_loans(member_id))
    }

    async fn shares_held(&self, member_id: Uuid) -> Result<i64, CoreError> {
        Ok(self.state.lock().await.shares_held(member_id))
    }

    async fn savings_total(&self, member_id: Uuid) -> Result<Decimal, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .savings
            .iter()
            .filter(|deposit| deposit.member_id == member_id)
            .map(|deposit| deposit.amount)
            .sum())
    }
}

#[async_trait]
impl StoreTx for MemTx {
    async fn commit(mut self: Box<Self>) -> Result<(), CoreError> {
        *self.guard = self.staged;
        Ok(())
    }

    async fn insert_action(&mut self, action: &AdminAction) -> Result<(), CoreError> {
        self.staged.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn action_for_update(&mut self, id: Uuid) -> Result<Option<AdminAction>, CoreError> {
        Ok(self.staged.actions.get(&id).cloned())
    }

    async fn has_verified(
        &mut self,
        action_id: Uuid,
        verifier_id: Uuid,
    ) -> Result<bool, CoreError> {
        Ok(self
            .staged
            .verifications
            .iter()
            .any(|v| v.action_id == action_id && v.verifier_id == verifier_id))
    }

    async fn insert_verification(
        &mut self,
        verification: &AdminVerification,
    ) -> Result<(), CoreError> {
        self.staged.verifications.push(verification.clone());
        Ok(())
    }

    async fn verification_tally(&mut self, action_id: Uuid) -> Result<VoteTally, CoreError> {
        let mut tally = VoteTally::default();
        for verification in self
            .staged
            .verifications
            .iter()
            .filter(|v| v.action_id == action_id)
        {
            match verification.decision {
                ApprovalDecision::Approved => tally.approvals += 1,
                ApprovalDecision::Rejected => tally.rejections += 1,
            }
        }
        Ok(tally)
    }

    async fn set_action_status(
        &mut self,
        id: Uuid,
        status: ActionStatus,
    ) -> Result<(), CoreError> {
        let action = self
            .staged
            .actions
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("action {id}")))?;
        action.status = status;
        Ok(())
    }

    async fn set_member_active(
        &mut self,
        member_id: Uuid,
        active: bool,
    ) -> Result<(), CoreError> {
        let member = self
            .staged
            .members
            .get_mut(&member_id)
            .ok_or_else(|| CoreError::not_found(format!("member {member_id}")))?;
        member.active = active;
        Ok(())
    }

    async fn insert_loan(&mut self, loan: &Loan) -> Result<(), CoreError> {
        self.staged.loans.insert(loan.id, loan.clone());
        Ok(())
    }

    async fn loan_for_update(&mut self, id: Uuid) -> Result<Option<Loan>, CoreError> {
        Ok(self.staged.loans.get(&id).cloned())
    }

    async fn set_loan_route(
        &mut self,
        loan_id: Uuid,
        workflow_id: Option<Uuid>,
        step_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        let loan = self
            .staged
            .loans
            .get_mut(&loan_id)
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        loan.workflow_id = workflow_id;
        loan.current_step_id = step_id;
        Ok(())
    }

    async fn set_loan_status(
        &mut self,
        loan_id: Uuid,
        status: LoanStatus,
    ) -> Result<(), CoreError> {
        let loan = self
            .staged
            .loans
            .get_mut(&loan_id)
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        loan.status = status;
        Ok(())
    }

    async fn approve_loan(
        &mut self,
        loan_id: Uuid,
        approved_amount: Decimal,
        balance_remaining: Decimal,
    ) -> Result<(), CoreError> {
        let loan = self
            .staged
            .loans
            .get_mut(&loan_id)
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        loan.status = LoanStatus::Approved;
        loan.approved_amount = Some(approved_amount);
        loan.balance_remaining = balance_remaining;
        loan.current_step_id = None;
        loan.approved_at = Some(Utc::now());
        Ok(())
    }

    async fn active_workflows(
        &mut self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalWorkflow>, CoreError> {
        let mut workflows: Vec<ApprovalWorkflow> = self
            .staged
            .workflows
            .values()
            .filter(|workflow| workflow.active && workflow.entity_type == entity_type)
            .cloned()
            .collect();
        workflows.sort_by_key(|workflow| workflow.min_amount);
        Ok(workflows)
    }

    async fn workflow_steps(&mut self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, CoreError> {
        Ok(self.staged.workflow_steps(workflow_id))
    }

    async fn insert_history(&mut self, entry: &ApprovalHistoryEntry) -> Result<(), CoreError> {
        self.staged.history.push(entry.clone());
        Ok(())
    }

    async fn step_approvals(&mut self, loan_id: Uuid, step_id: Uuid) -> Result<i64, CoreError> {
        Ok(self.staged.step_approvals(loan_id, step_id))
    }

    async fn has_approved_step(
        &mut self,
        loan_id: Uuid,
        step_id: Uuid,
        approver_id: Uuid,
    ) -> Result<bool, CoreError> {
        Ok(self.staged.history.iter().any(|entry| {
            entry.entity_id == loan_id
                && entry.step_id == step_id
                && entry.approver_id == approver_id
                && entry.decision == ApprovalDecision::Approved
        }))
    }

    async fn insert_transaction(
        &mut self,
        transaction: &PaymentTransaction,
    ) -> Result<(), CoreError> {
        self.staged
            .transactions
            .insert(transaction.reference.clone(), transaction.clone());
        Ok(())
    }

    async fn settle_transaction(
        &mut self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, CoreError> {
        match self.staged.transactions.get_mut(reference) {
            Some(transaction) if transaction.status == TransactionStatus::Pending => {
                transaction.status = TransactionStatus::Completed;
                transaction.completed_at = Some(Utc::now());
                Ok(Some(transaction.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn fail_transaction(&mut self, reference: &str) -> Result<bool, CoreError> {
        match self.staged.transactions.get_mut(reference) {
            Some(transaction) if transaction.status == TransactionStatus::Pending => {
                transaction.status = TransactionStatus::Failed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_allocation(
        &mut self,
        reference: &str,
        breakdown: &AllocationBreakdown,
    ) -> Result<(), CoreError> {
        let transaction = self
            .staged
            .transactions
            .get_mut(reference)
            .ok_or_else(|| CoreError::not_found(format!("transaction {reference}")))?;
        transaction.allocation = Some(*breakdown);
        Ok(())
    }

    async fn active_loans(&mut self, member_id: Uuid) -> Result<Vec<Loan>, CoreError> {
        Ok(self.staged.active_loans(member_id))
    }

    async fn apply_repayment(
        &mut self,
        loan_id: Uuid,
        amount: Decimal,
    ) -> Result<Decimal, CoreError> {
        let loan = self
            .staged
            .loans
            .get_mut(&loan_id)
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        loan.balance_remaining -= amount;
        Ok(loan.balance_remaining)
    }

    async fn insert_repayment(&mut self, repayment: &LoanRepayment) -> Result<(), CoreError> {
        self.staged.repayments.push(repayment.clone());
        Ok(())
    }

    async fn mark_loan_paid(&mut self, loan_id: Uuid) -> Result<(), CoreError> {
        let loan = self
            .staged
            .loans
            .get_mut(&loan_id)
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        loan.status = LoanStatus::Paid;
        loan.balance_remaining = Decimal::ZERO;
        Ok(())
    }

    async fn release_guarantors(&mut self, loan_id: Uuid) -> Result<u64, CoreError> {
        let mut released = 0;
        for guarantor in self.staged.guarantors.values_mut() {
            if guarantor.loan_id == loan_id && guarantor.status == GuarantorStatus::Accepted {
                guarantor.status = GuarantorStatus::Released;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn insert_income(&mut self, entry: &IncomeEntry) -> Result<(), CoreError> {
        self.staged.income.push(entry.clone());
        Ok(())
    }

    async fn insert_welfare_payment(
        &mut self,
        payment: &WelfarePayment,
    ) -> Result<(), CoreError> {
        self.staged.welfare.push(payment.clone());
        Ok(())
    }

    async fn shares_held(&mut self, member_id: Uuid) -> Result<i64, CoreError> {
        Ok(self.staged.shares_held(member_id))
    }

    async fn insert_share_purchase(
        &mut self,
        purchase: &SharePurchase,
    ) -> Result<(), CoreError> {
        self.staged.shares.push(purchase.clone());
        Ok(())
    }

    async fn insert_savings_deposit(
        &mut self,
        deposit: &SavingsDeposit,
    ) -> Result<(), CoreError> {
        self.staged.savings.push(deposit.clone());
        Ok(())
    }
}

/// Role assignments held in memory, for tests and single-node setups.
#[derive(Default)]
pub struct InMemoryRoles {
    assignments: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl InMemoryRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, user_id: Uuid, role: &str) {
        self.assignments
            .write()
            .await
            .entry(role.to_string())
            .or_default()
            .insert(user_id);
    }
}

#[async_trait]
impl RoleDirectory for InMemoryRoles {
    async fn has_role(&self, user_id: Uuid, role: &str) -> anyhow::Result<bool> {
        Ok(self
            .assignments
            .read()
            .await
            .get(role)
            .is_some_and(|holders| holders.contains(&user_id)))
    }

    async fn role_holders(&self, role: &str) -> anyhow::Result<Vec<Uuid>> {
        Ok(self
            .assignments
            .read()
            .await
            .get(role)
            .map(|holders| holders.iter().copied().collect())
            .unwrap_or_default())
    }
}

/// Captures notices instead of delivering them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Vec<Uuid>, Notice)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(Vec<Uuid>, Notice)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipients: &[Uuid], notice: Notice) -> anyhow::Result<()> {
        self.sent.lock().await.push((recipients.to_vec(), notice));
        Ok(())
    }
}

/// Always fails; proves notification failures never poison an engine call.
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _recipients: &[Uuid], _notice: Notice) -> anyhow::Result<()> {
        anyhow::bail!("notification channel down")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pending_transaction(reference: &str) -> PaymentTransaction {
        PaymentTransaction {
            id: Uuid::new_v4(),
            member_id: Uuid::new_v4(),
            amount: dec!(1000),
            kind: "deposit".to_string(),
            reference: reference.to_string(),
            status: TransactionStatus::Pending,
            allocation: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        store.seed_transaction(pending_transaction("REF-1")).await;

        {
            let mut tx = store.begin().await.unwrap();
            tx.settle_transaction("REF-1").await.unwrap();
            // dropped without commit
        }

        let transaction = store.transaction_by_reference("REF-1").await.unwrap().unwrap();
        assert_eq!(transaction.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn settle_admits_exactly_one_winner() {
        let store = InMemoryStore::new();
        store.seed_transaction(pending_transaction("REF-2")).await;

        let mut tx = store.begin().await.unwrap();
        assert!(tx.settle_transaction("REF-2").await.unwrap().is_some());
        assert!(tx.settle_transaction("REF-2").await.unwrap().is_none());
        tx.commit().await.unwrap();

        let mut retry = store.begin().await.unwrap();
        assert!(retry.settle_transaction("REF-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_publishes_staged_writes() {
        let store = InMemoryStore::new();
        store.seed_transaction(pending_transaction("REF-3")).await;

        let mut tx = store.begin().await.unwrap();
        tx.settle_transaction("REF-3").await.unwrap();
        tx.commit().await.unwrap();

        let transaction = store.transaction_by_reference("REF-3").await.unwrap().unwrap();
        assert_eq!(transaction.status, TransactionStatus::Completed);
        assert!(transaction.completed_at.is_some());
    }
}
