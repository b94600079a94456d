//! Postgres persistence for the approval and settlement engines. Row
//! locks (`FOR UPDATE`) serialize concurrent voters and allocators, and
//! conditional single-statement updates keep settlement idempotent even
//! across processes.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use sacco_core::errors::CoreError;
use sacco_core::external::RoleDirectory;
use sacco_core::models::{
    ActionStatus, ActionTarget, AdminAction, AdminVerification, AllocationBreakdown,
    ApprovalDecision, ApprovalHistoryEntry, ApprovalWorkflow, IncomeEntry, Loan, LoanRepayment,
    LoanStatus, PaymentTransaction, SavingsDeposit, SharePurchase, TransactionStatus, VoteTally,
    WelfarePayment, WorkflowStep,
};
use sacco_core::storage::{Store, StoreTx};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn db_err(err: sqlx::Error) -> CoreError {
    CoreError::storage(err)
}

const ACTION_COLUMNS: &str =
    "id, initiated_by, action_type, target_type, entity_id, reason, payload, status, created_at";

fn read_action(row: &PgRow) -> Result<AdminAction, CoreError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = ActionStatus::parse(&status_raw)
        .ok_or_else(|| CoreError::system(format!("unrecognized action status {status_raw}")))?;
    let target_raw: String = row.try_get("target_type").map_err(db_err)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(db_err)?;

    Ok(AdminAction {
        id: row.try_get("id").map_err(db_err)?,
        initiated_by: row.try_get("initiated_by").map_err(db_err)?,
        action_type: row.try_get("action_type").map_err(db_err)?,
        target: ActionTarget::parse(&target_raw),
        entity_id: row.try_get("entity_id").map_err(db_err)?,
        reason: row.try_get("reason").map_err(db_err)?,
        // legacy payloads that no longer parse load as None and are
        // skipped at dispatch
        kind: serde_json::from_value(payload).ok(),
        status,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

const LOAN_COLUMNS: &str = "id, borrower_id, requested_amount, approved_amount, interest_rate, \
     repayment_months, balance_remaining, status, workflow_id, current_step_id, created_at, \
     approved_at";

fn read_loan(row: &PgRow) -> Result<Loan, CoreError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = LoanStatus::parse(&status_raw)
        .ok_or_else(|| CoreError::system(format!("unrecognized loan status {status_raw}")))?;

    Ok(Loan {
        id: row.try_get("id").map_err(db_err)?,
        borrower_id: row.try_get("borrower_id").map_err(db_err)?,
        requested_amount: row.try_get("requested_amount").map_err(db_err)?,
        approved_amount: row.try_get("approved_amount").map_err(db_err)?,
        interest_rate: row.try_get("interest_rate").map_err(db_err)?,
        repayment_months: row.try_get("repayment_months").map_err(db_err)?,
        balance_remaining: row.try_get("balance_remaining").map_err(db_err)?,
        status,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        current_step_id: row.try_get("current_step_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        approved_at: row.try_get("approved_at").map_err(db_err)?,
    })
}

fn read_workflow(row: &PgRow) -> Result<ApprovalWorkflow, CoreError> {
    Ok(ApprovalWorkflow {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        entity_type: row.try_get("entity_type").map_err(db_err)?,
        min_amount: row.try_get("min_amount").map_err(db_err)?,
        max_amount: row.try_get("max_amount").map_err(db_err)?,
        is_default: row.try_get("is_default").map_err(db_err)?,
        active: row.try_get("active").map_err(db_err)?,
    })
}

fn read_step(row: &PgRow) -> Result<WorkflowStep, CoreError> {
    Ok(WorkflowStep {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        step_order: row.try_get("step_order").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        role: row.try_get("role").map_err(db_err)?,
        approvers_required: row.try_get("approvers_required").map_err(db_err)?,
    })
}

fn read_history(row: &PgRow) -> Result<ApprovalHistoryEntry, CoreError> {
    let decision_raw: String = row.try_get("decision").map_err(db_err)?;
    let decision = ApprovalDecision::parse(&decision_raw)
        .ok_or_else(|| CoreError::system(format!("unrecognized decision {decision_raw}")))?;

    Ok(ApprovalHistoryEntry {
        id: row.try_get("id").map_err(db_err)?,
        entity_type: row.try_get("entity_type").map_err(db_err)?,
        entity_id: row.try_get("entity_id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        step_id: row.try_get("step_id").map_err(db_err)?,
        approver_id: row.try_get("approver_id").map_err(db_err)?,
        decision,
        comment: row.try_get("comment").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

const TRANSACTION_COLUMNS: &str =
    "id, member_id, amount, kind, reference, status, allocation, created_at, completed_at";

fn read_transaction(row: &PgRow) -> Result<PaymentTransaction, CoreError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = TransactionStatus::parse(&status_raw)
        .ok_or_else(|| CoreError::system(format!("unrecognized transaction status {status_raw}")))?;
    let allocation: Option<serde_json::Value> = row.try_get("allocation").map_err(db_err)?;

    Ok(PaymentTransaction {
        id: row.try_get("id").map_err(db_err)?,
        member_id: row.try_get("member_id").map_err(db_err)?,
        amount: row.try_get("amount").map_err(db_err)?,
        kind: row.try_get("kind").map_err(db_err)?,
        reference: row.try_get("reference").map_err(db_err)?,
        status,
        allocation: allocation.and_then(|value| serde_json::from_value(value).ok()),
        created_at: row.try_get("created_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx + '_>, CoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn action(&self, id: Uuid) -> Result<Option<AdminAction>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM admin_actions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(read_action).transpose()
    }

    async fn loan(&self, id: Uuid) -> Result<Option<Loan>, CoreError> {
        let row = sqlx::query(&format!("SELECT {LOAN_COLUMNS} FROM loans WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(read_loan).transpose()
    }

    async fn workflow(&self, id: Uuid) -> Result<Option<ApprovalWorkflow>, CoreError> {
        let row = sqlx::query(
            "SELECT id, name, entity_type, min_amount, max_amount, is_default, active \
             FROM approval_workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(read_workflow).transpose()
    }

    async fn workflow_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, step_order, name, role, approvers_required \
             FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_order",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(read_step).collect()
    }

    async fn step_approvals(&self, loan_id: Uuid, step_id: Uuid) -> Result<i64, CoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*)::BIGINT AS approvals FROM approval_history \
             WHERE entity_id = $1 AND step_id = $2 AND decision = 'approved'",
        )
        .bind(loan_id)
        .bind(step_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("approvals").map_err(db_err)
    }

    async fn approval_history(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<ApprovalHistoryEntry>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, workflow_id, step_id, approver_id, decision, \
             comment, created_at \
             FROM approval_history WHERE entity_id = $1 ORDER BY created_at",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(read_history).collect()
    }

    async fn transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(read_transaction).transpose()
    }

    async fn active_loans(&self, member_id: Uuid) -> Result<Vec<Loan>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOAN_COLUMNS} FROM loans \
             WHERE borrower_id = $1 AND status = 'active' ORDER BY created_at"
        ))
        .bind(member_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(read_loan).collect()
    }

    async fn shares_held(&self, member_id: Uuid) -> Result<i64, CoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT AS held \
             FROM share_purchases WHERE member_id = $1",
        )
        .bind(member_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("held").map_err(db_err)
    }

    async fn savings_total(&self, member_id: Uuid) -> Result<Decimal, CoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS total \
             FROM savings_deposits WHERE member_id = $1",
        )
        .bind(member_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("total").map_err(db_err)
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn insert_action(&mut self, action: &AdminAction) -> Result<(), CoreError> {
        let payload = serde_json::to_value(&action.kind).map_err(CoreError::storage)?;
        sqlx::query(
            "INSERT INTO admin_actions \
             (id, initiated_by, action_type, target_type, entity_id, reason, payload, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(action.id)
        .bind(action.initiated_by)
        .bind(&action.action_type)
        .bind(action.target.as_str())
        .bind(action.entity_id)
        .bind(&action.reason)
        .bind(payload)
        .bind(action.status.as_str())
        .bind(action.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn action_for_update(&mut self, id: Uuid) -> Result<Option<AdminAction>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM admin_actions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(read_action).transpose()
    }

    async fn has_verified(
        &mut self,
        action_id: Uuid,
        verifier_id: Uuid,
    ) -> Result<bool, CoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM admin_verifications \
             WHERE action_id = $1 AND verifier_id = $2) AS present",
        )
        .bind(action_id)
        .bind(verifier_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.try_get("present").map_err(db_err)
    }

    async fn insert_verification(
        &mut self,
        verification: &AdminVerification,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO admin_verifications \
             (id, action_id, verifier_id, decision, comment, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(verification.id)
        .bind(verification.action_id)
        .bind(verification.verifier_id)
        .bind(verification.decision.as_str())
        .bind(verification.comment.as_deref())
        .bind(verification.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn verification_tally(&mut self, action_id: Uuid) -> Result<VoteTally, CoreError> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE decision = 'approved')::BIGINT AS approvals, \
                COUNT(*) FILTER (WHERE decision = 'rejected')::BIGINT AS rejections \
             FROM admin_verifications WHERE action_id = $1",
        )
        .bind(action_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(VoteTally {
            approvals: row.try_get("approvals").map_err(db_err)?,
            rejections: row.try_get("rejections").map_err(db_err)?,
        })
    }

    async fn set_action_status(&mut self, id: Uuid, status: ActionStatus) -> Result<(), CoreError> {
        sqlx::query("UPDATE admin_actions SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_member_active(
        &mut self,
        member_id: Uuid,
        active: bool,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE members SET active = $2 WHERE id = $1")
            .bind(member_id)
            .bind(active)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_loan(&mut self, loan: &Loan) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO loans \
             (id, borrower_id, requested_amount, approved_amount, interest_rate, \
              repayment_months, balance_remaining, status, workflow_id, current_step_id, \
              created_at, approved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(loan.id)
        .bind(loan.borrower_id)
        .bind(loan.requested_amount)
        .bind(loan.approved_amount)
        .bind(loan.interest_rate)
        .bind(loan.repayment_months)
        .bind(loan.balance_remaining)
        .bind(loan.status.as_str())
        .bind(loan.workflow_id)
        .bind(loan.current_step_id)
        .bind(loan.created_at)
        .bind(loan.approved_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn loan_for_update(&mut self, id: Uuid) -> Result<Option<Loan>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LOAN_COLUMNS} FROM loans WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(read_loan).transpose()
    }

    async fn set_loan_route(
        &mut self,
        loan_id: Uuid,
        workflow_id: Option<Uuid>,
        step_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE loans SET workflow_id = $2, current_step_id = $3 WHERE id = $1")
            .bind(loan_id)
            .bind(workflow_id)
            .bind(step_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_loan_status(
        &mut self,
        loan_id: Uuid,
        status: LoanStatus,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE loans SET status = $2 WHERE id = $1")
            .bind(loan_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn approve_loan(
        &mut self,
        loan_id: Uuid,
        approved_amount: Decimal,
        balance_remaining: Decimal,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE loans SET status = 'approved', approved_amount = $2, \
             balance_remaining = $3, current_step_id = NULL, approved_at = $4 \
             WHERE id = $1",
        )
        .bind(loan_id)
        .bind(approved_amount)
        .bind(balance_remaining)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn active_workflows(
        &mut self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalWorkflow>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, name, entity_type, min_amount, max_amount, is_default, active \
             FROM approval_workflows WHERE entity_type = $1 AND active = TRUE \
             ORDER BY is_default DESC, min_amount DESC NULLS LAST",
        )
        .bind(entity_type)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(read_workflow).collect()
    }

    async fn workflow_steps(&mut self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, step_order, name, role, approvers_required \
             FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_order",
        )
        .bind(workflow_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(read_step).collect()
    }

    async fn insert_history(&mut self, entry: &ApprovalHistoryEntry) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO approval_history \
             (id, entity_type, entity_id, workflow_id, step_id, approver_id, decision, comment, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(&entry.entity_type)
        .bind(entry.entity_id)
        .bind(entry.workflow_id)
        .bind(entry.step_id)
        .bind(entry.approver_id)
        .bind(entry.decision.as_str())
        .bind(entry.comment.as_deref())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn step_approvals(&mut self, loan_id: Uuid, step_id: Uuid) -> Result<i64, CoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*)::BIGINT AS approvals FROM approval_history \
             WHERE entity_id = $1 AND step_id = $2 AND decision = 'approved'",
        )
        .bind(loan_id)
        .bind(step_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.try_get("approvals").map_err(db_err)
    }

    async fn has_approved_step(
        &mut self,
        loan_id: Uuid,
        step_id: Uuid,
        approver_id: Uuid,
    ) -> Result<bool, CoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM approval_history \
             WHERE entity_id = $1 AND step_id = $2 AND approver_id = $3 \
               AND decision = 'approved') AS present",
        )
        .bind(loan_id)
        .bind(step_id)
        .bind(approver_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.try_get("present").map_err(db_err)
    }

    async fn insert_transaction(
        &mut self,
        transaction: &PaymentTransaction,
    ) -> Result<(), CoreError> {
        let allocation = transaction
            .allocation
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(CoreError::storage)?;
        sqlx::query(
            "INSERT INTO payment_transactions \
             (id, member_id, amount, kind, reference, status, allocation, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(transaction.id)
        .bind(transaction.member_id)
        .bind(transaction.amount)
        .bind(&transaction.kind)
        .bind(&transaction.reference)
        .bind(transaction.status.as_str())
        .bind(allocation)
        .bind(transaction.created_at)
        .bind(transaction.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn settle_transaction(
        &mut self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, CoreError> {
        // only one caller flips pending -> completed; everyone else sees
        // no row and treats the settlement as already done
        let row = sqlx::query(&format!(
            "UPDATE payment_transactions \
             SET status = 'completed', completed_at = $2 \
             WHERE reference = $1 AND status = 'pending' \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(reference)
        .bind(Utc::now())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(read_transaction).transpose()
    }

    async fn fail_transaction(&mut self, reference: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE payment_transactions SET status = 'failed' \
             WHERE reference = $1 AND status = 'pending'",
        )
        .bind(reference)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_allocation(
        &mut self,
        reference: &str,
        breakdown: &AllocationBreakdown,
    ) -> Result<(), CoreError> {
        let allocation = serde_json::to_value(breakdown).map_err(CoreError::storage)?;
        sqlx::query("UPDATE payment_transactions SET allocation = $2 WHERE reference = $1")
            .bind(reference)
            .bind(allocation)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn active_loans(&mut self, member_id: Uuid) -> Result<Vec<Loan>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOAN_COLUMNS} FROM loans \
             WHERE borrower_id = $1 AND status = 'active' \
             ORDER BY created_at FOR UPDATE"
        ))
        .bind(member_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(read_loan).collect()
    }

    async fn apply_repayment(
        &mut self,
        loan_id: Uuid,
        amount: Decimal,
    ) -> Result<Decimal, CoreError> {
        let row = sqlx::query(
            "UPDATE loans SET balance_remaining = balance_remaining - $2 \
             WHERE id = $1 RETURNING balance_remaining",
        )
        .bind(loan_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.try_get("balance_remaining").map_err(db_err)
    }

    async fn insert_repayment(&mut self, repayment: &LoanRepayment) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO loan_repayments \
             (id, loan_id, amount, principal, interest, reference, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(repayment.id)
        .bind(repayment.loan_id)
        .bind(repayment.amount)
        .bind(repayment.principal)
        .bind(repayment.interest)
        .bind(&repayment.reference)
        .bind(repayment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_loan_paid(&mut self, loan_id: Uuid) -> Result<(), CoreError> {
        sqlx::query("UPDATE loans SET status = 'paid' WHERE id = $1")
            .bind(loan_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn release_guarantors(&mut self, loan_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE loan_guarantors SET status = 'released' \
             WHERE loan_id = $1 AND status = 'accepted'",
        )
        .bind(loan_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_income(&mut self, entry: &IncomeEntry) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO income_entries (id, amount, source, description, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.id)
        .bind(entry.amount)
        .bind(&entry.source)
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_welfare_payment(
        &mut self,
        payment: &WelfarePayment,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO welfare_payments (id, member_id, amount, reference, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(payment.id)
        .bind(payment.member_id)
        .bind(payment.amount)
        .bind(&payment.reference)
        .bind(payment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn shares_held(&mut self, member_id: Uuid) -> Result<i64, CoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT AS held \
             FROM share_purchases WHERE member_id = $1",
        )
        .bind(member_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.try_get("held").map_err(db_err)
    }

    async fn insert_share_purchase(
        &mut self,
        purchase: &SharePurchase,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO share_purchases (id, member_id, quantity, amount_paid, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(purchase.id)
        .bind(purchase.member_id)
        .bind(purchase.quantity)
        .bind(purchase.amount_paid)
        .bind(purchase.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_savings_deposit(
        &mut self,
        deposit: &SavingsDeposit,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO savings_deposits (id, member_id, amount, reference, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(deposit.id)
        .bind(deposit.member_id)
        .bind(deposit.amount)
        .bind(&deposit.reference)
        .bind(deposit.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

/// Role checks backed by the `user_roles` table.
#[derive(Clone)]
pub struct PgRoles {
    pool: PgPool,
}

impl PgRoles {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleDirectory for PgRoles {
    async fn has_role(&self, user_id: Uuid, role: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM user_roles WHERE user_id = $1 AND role = $2) AS present",
        )
        .bind(user_id)
        .bind(role)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn role_holders(&self, role: &str) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT user_id FROM user_roles WHERE role = $1 ORDER BY user_id")
            .bind(role)
            .fetch_all(&self.pool)
            .await?;
        let mut holders = Vec::with_capacity(rows.len());
        for row in rows {
            holders.push(row.try_get::<Uuid, _>("user_id")?);
        }
        Ok(holders)
    }
}
