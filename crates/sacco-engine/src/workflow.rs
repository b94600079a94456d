use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use sacco_core::errors::CoreError;
use sacco_core::external::{Notice, Notifier, RoleDirectory};
use sacco_core::models::{
    ApprovalDecision, ApprovalHistoryEntry, ApprovalWorkflow, Loan, LoanStatus, WorkflowStep,
};
use sacco_core::storage::Store;

const LOAN_ENTITY: &str = "loan";

/// Where a freshly routed loan sits.
#[derive(Debug, Clone, Serialize)]
pub struct LoanRoute {
    pub loan: Loan,
    pub workflow: ApprovalWorkflow,
    pub current_step: WorkflowStep,
    pub total_steps: usize,
}

/// Result of one approval decision on the current step.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    /// More approvals are needed on the same step.
    Pending { approvals: i64, required: i32 },
    /// The step completed and the loan moved to the next one.
    Advanced { next_step: WorkflowStep },
    /// Every step completed; the loan is approved and unrouted.
    Approved,
    /// Terminal rejection.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepProgress {
    pub step: WorkflowStep,
    pub approvals: i64,
    pub is_current: bool,
    pub is_complete: bool,
    pub percent: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowProgress {
    pub workflow: ApprovalWorkflow,
    pub steps: Vec<StepProgress>,
    pub history: Vec<ApprovalHistoryEntry>,
    pub current_step_order: Option<i32>,
    pub total_steps: usize,
}

/// Amount-tiered, role-gated loan approval. A loan is routed onto the
/// workflow whose band covers the requested amount and walks its steps in
/// strictly increasing order; rejection at any step is terminal.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    roles: Arc<dyn RoleDirectory>,
    notifier: Arc<dyn Notifier>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        roles: Arc<dyn RoleDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            roles,
            notifier,
        }
    }

    /// Creates a pending loan and routes it in one transaction, so a
    /// routing failure leaves no loan behind.
    pub async fn create_loan(
        &self,
        borrower: Uuid,
        amount: Decimal,
        interest_rate: Decimal,
        repayment_months: i32,
    ) -> Result<LoanRoute, CoreError> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::validation("loan amount must be positive"));
        }
        if repayment_months < 1 {
            return Err(CoreError::validation("repayment period must be at least one month"));
        }
        if interest_rate < Decimal::ZERO {
            return Err(CoreError::validation("interest rate must not be negative"));
        }

        let mut tx = self.store.begin().await?;

        let workflows = tx.active_workflows(LOAN_ENTITY).await?;
        let workflow = select_workflow(&workflows, amount)
            .ok_or_else(|| {
                CoreError::system(format!("no approval workflow covers amount {amount}"))
            })?
            .clone();
        let steps = tx.workflow_steps(workflow.id).await?;
        let first_step = steps
            .first()
            .ok_or_else(|| {
                CoreError::system(format!("workflow {} has no steps", workflow.name))
            })?
            .clone();

        let loan = Loan {
            id: Uuid::new_v4(),
            borrower_id: borrower,
            requested_amount: amount,
            approved_amount: None,
            interest_rate,
            repayment_months,
            balance_remaining: Decimal::ZERO,
            status: LoanStatus::Pending,
            workflow_id: Some(workflow.id),
            current_step_id: Some(first_step.id),
            created_at: Utc::now(),
            approved_at: None,
        };
        tx.insert_loan(&loan).await?;
        tx.commit().await?;

        Ok(LoanRoute {
            loan,
            workflow,
            current_step: first_step,
            total_steps: steps.len(),
        })
    }

    /// Routes an existing loan onto the workflow for `amount`.
    pub async fn initialize(&self, loan_id: Uuid, amount: Decimal) -> Result<LoanRoute, CoreError> {
        let mut tx = self.store.begin().await?;

        let loan = tx
            .loan_for_update(loan_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;

        let workflows = tx.active_workflows(LOAN_ENTITY).await?;
        let workflow = select_workflow(&workflows, amount)
            .ok_or_else(|| {
                CoreError::system(format!("no approval workflow covers amount {amount}"))
            })?
            .clone();
        let steps = tx.workflow_steps(workflow.id).await?;
        let first_step = steps
            .first()
            .ok_or_else(|| {
                CoreError::system(format!("workflow {} has no steps", workflow.name))
            })?
            .clone();

        tx.set_loan_route(loan_id, Some(workflow.id), Some(first_step.id))
            .await?;
        tx.commit().await?;

        Ok(LoanRoute {
            loan: Loan {
                workflow_id: Some(workflow.id),
                current_step_id: Some(first_step.id),
                ..loan
            },
            workflow,
            current_step: first_step,
            total_steps: steps.len(),
        })
    }

    pub async fn decide(
        &self,
        loan_id: Uuid,
        approver: Uuid,
        decision: ApprovalDecision,
        comment: Option<&str>,
    ) -> Result<StepOutcome, CoreError> {
        let mut tx = self.store.begin().await?;

        let loan = tx
            .loan_for_update(loan_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        let (Some(workflow_id), Some(step_id)) = (loan.workflow_id, loan.current_step_id) else {
            return Err(CoreError::conflict("loan workflow is not awaiting a decision"));
        };

        let steps = tx.workflow_steps(workflow_id).await?;
        let step = steps
            .iter()
            .find(|step| step.id == step_id)
            .ok_or_else(|| CoreError::system(format!("step {step_id} missing from workflow")))?
            .clone();

        if !self
            .roles
            .has_role(approver, &step.role)
            .await
            .map_err(CoreError::storage)?
        {
            return Err(CoreError::authorization(format!(
                "approver does not hold the {} role required by this step",
                step.role
            )));
        }
        if loan.borrower_id == approver {
            return Err(CoreError::authorization("you cannot approve your own loan"));
        }
        if tx.has_approved_step(loan_id, step_id, approver).await? {
            return Err(CoreError::authorization("you have already approved this step"));
        }

        tx.insert_history(&ApprovalHistoryEntry {
            id: Uuid::new_v4(),
            entity_type: LOAN_ENTITY.to_string(),
            entity_id: loan_id,
            workflow_id,
            step_id,
            approver_id: approver,
            decision,
            comment: comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            created_at: Utc::now(),
        })
        .await?;

        if decision == ApprovalDecision::Rejected {
            tx.set_loan_status(loan_id, LoanStatus::Rejected).await?;
            tx.set_loan_route(loan_id, Some(workflow_id), None).await?;
            tx.commit().await?;
            self.notify_borrower(
                &loan,
                "loan_rejected",
                "Loan application rejected",
                format!("Your loan application of KSh {} was rejected.", loan.requested_amount),
            )
            .await;
            return Ok(StepOutcome::Rejected);
        }

        let approvals = tx.step_approvals(loan_id, step_id).await?;
        if approvals < i64::from(step.approvers_required) {
            tx.commit().await?;
            return Ok(StepOutcome::Pending {
                approvals,
                required: step.approvers_required,
            });
        }

        // Step complete; the next step is the smallest strictly greater
        // step_order, so no step is ever revisited.
        if let Some(next_step) = steps.iter().find(|next| next.step_order > step.step_order) {
            tx.set_loan_route(loan_id, Some(workflow_id), Some(next_step.id))
                .await?;
            tx.commit().await?;
            return Ok(StepOutcome::Advanced {
                next_step: next_step.clone(),
            });
        }

        let approved_amount = loan.approved_amount.unwrap_or(loan.requested_amount);
        let balance = loan.balance_with_interest(approved_amount);
        tx.approve_loan(loan_id, approved_amount, balance).await?;
        tx.commit().await?;

        self.notify_borrower(
            &loan,
            "loan_approved",
            "Loan approved",
            format!(
                "Your loan of KSh {approved_amount} has been approved. Total repayable: KSh {balance}."
            ),
        )
        .await;

        Ok(StepOutcome::Approved)
    }

    /// Read-only reconstruction of per-step progress for display.
    pub async fn progress(&self, loan_id: Uuid) -> Result<WorkflowProgress, CoreError> {
        let loan = self
            .store
            .loan(loan_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        let workflow_id = loan
            .workflow_id
            .ok_or_else(|| CoreError::conflict("loan has no workflow assigned"))?;
        let workflow = self
            .store
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("workflow {workflow_id}")))?;
        let steps = self.store.workflow_steps(workflow_id).await?;

        let mut progress = Vec::with_capacity(steps.len());
        let mut current_step_order = None;
        for step in steps.iter() {
            let approvals = self.store.step_approvals(loan_id, step.id).await?;
            let is_current = loan.current_step_id == Some(step.id);
            if is_current {
                current_step_order = Some(step.step_order);
            }
            let required = i64::from(step.approvers_required.max(1));
            progress.push(StepProgress {
                step: step.clone(),
                approvals,
                is_current,
                is_complete: approvals >= required,
                percent: ((approvals * 100 / required).min(100)) as i32,
            });
        }

        Ok(WorkflowProgress {
            workflow,
            history: self.store.approval_history(loan_id).await?,
            total_steps: steps.len(),
            steps: progress,
            current_step_order,
        })
    }

    /// Marks an approved loan as disbursed and therefore active.
    pub async fn disburse(&self, loan_id: Uuid) -> Result<(), CoreError> {
        let mut tx = self.store.begin().await?;
        let loan = tx
            .loan_for_update(loan_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("loan {loan_id}")))?;
        if loan.status != LoanStatus::Approved {
            return Err(CoreError::conflict("loan must be approved before disbursement"));
        }
        tx.set_loan_status(loan_id, LoanStatus::Active).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn notify_borrower(&self, loan: &Loan, kind: &str, title: &str, message: String) {
        let notice = Notice::new(kind, title, message).about(LOAN_ENTITY, loan.id);
        if let Err(err) = self.notifier.notify(&[loan.borrower_id], notice).await {
            warn!(loan_id = %loan.id, "borrower notification failed: {err}");
        }
    }
}

/// Picks the workflow whose band contains `amount`: defaults win over
/// non-defaults, then the highest `min_amount` (most specific band).
pub fn select_workflow(
    workflows: &[ApprovalWorkflow],
    amount: Decimal,
) -> Option<&ApprovalWorkflow> {
    workflows
        .iter()
        .filter(|workflow| workflow.covers(amount))
        .max_by_key(|workflow| (workflow.is_default, workflow.min_amount.unwrap_or(Decimal::MIN)))
}
