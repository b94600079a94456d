use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use sacco_core::errors::CoreError;
use sacco_core::external::{Notice, Notifier, RoleDirectory};
use sacco_core::models::{
    ActionStatus, ActionTarget, AdminAction, AdminActionKind, AdminVerification,
    ApprovalDecision, LoanStatus,
};
use sacco_core::storage::{Store, StoreTx};

pub const ADMIN_ROLE: &str = "admin";

/// Outcome of a single verification vote.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub status: ActionStatus,
    pub approvals: i64,
    pub rejections: i64,
}

/// Dual-consensus gate for sensitive administrative mutations: one
/// administrator proposes, a quorum of others ratifies, and the effect
/// executes exactly once inside the deciding vote's transaction.
pub struct ConsensusActionService {
    store: Arc<dyn Store>,
    roles: Arc<dyn RoleDirectory>,
    notifier: Arc<dyn Notifier>,
    quorum: i64,
}

impl ConsensusActionService {
    pub fn new(
        store: Arc<dyn Store>,
        roles: Arc<dyn RoleDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            roles,
            notifier,
            quorum: 2,
        }
    }

    /// Votes required on either side before the action resolves. A fixed
    /// count, not a fraction of the admin pool.
    pub fn with_quorum(mut self, quorum: i64) -> Self {
        self.quorum = quorum.max(1);
        self
    }

    pub async fn initiate(
        &self,
        initiator: Uuid,
        entity_id: Uuid,
        reason: &str,
        kind: AdminActionKind,
    ) -> Result<AdminAction, CoreError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CoreError::validation("reason is required"));
        }
        validate_kind(&kind)?;

        let action = AdminAction {
            id: Uuid::new_v4(),
            initiated_by: initiator,
            action_type: kind.action_type().to_string(),
            target: kind.target(),
            entity_id,
            reason: reason.to_string(),
            kind: Some(kind),
            status: ActionStatus::Pending,
            created_at: Utc::now(),
        };

        let mut tx = self.store.begin().await?;
        tx.insert_action(&action).await?;
        tx.commit().await?;

        self.notify_other_admins(&action).await;

        Ok(action)
    }

    pub async fn verify(
        &self,
        action_id: Uuid,
        verifier: Uuid,
        decision: ApprovalDecision,
        comment: Option<&str>,
    ) -> Result<VerifyOutcome, CoreError> {
        let mut tx = self.store.begin().await?;

        let action = tx
            .action_for_update(action_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("action {action_id}")))?;

        if action.status != ActionStatus::Pending {
            return Err(CoreError::conflict("action already processed"));
        }
        if action.initiated_by == verifier {
            return Err(CoreError::authorization("cannot verify your own action"));
        }
        if tx.has_verified(action_id, verifier).await? {
            return Err(CoreError::authorization(
                "you have already verified this action",
            ));
        }

        let verification = AdminVerification {
            id: Uuid::new_v4(),
            action_id,
            verifier_id: verifier,
            decision,
            comment: comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            created_at: Utc::now(),
        };
        tx.insert_verification(&verification).await?;

        // Recount inside the same transaction as the insert; the row lock
        // taken above serializes concurrent voters, so exactly one vote
        // observes the threshold crossing.
        let tally = tx.verification_tally(action_id).await?;

        let status = if tally.approvals >= self.quorum {
            tx.set_action_status(action_id, ActionStatus::Approved)
                .await?;
            execute_effect(tx.as_mut(), &action).await?;
            ActionStatus::Approved
        } else if tally.rejections >= self.quorum {
            tx.set_action_status(action_id, ActionStatus::Rejected)
                .await?;
            ActionStatus::Rejected
        } else {
            ActionStatus::Pending
        };

        tx.commit().await?;

        Ok(VerifyOutcome {
            status,
            approvals: tally.approvals,
            rejections: tally.rejections,
        })
    }

    async fn notify_other_admins(&self, action: &AdminAction) {
        let admins = match self.roles.role_holders(ADMIN_ROLE).await {
            Ok(admins) => admins,
            Err(err) => {
                warn!(action_id = %action.id, "could not resolve admin pool for notification: {err}");
                return;
            }
        };
        let recipients: Vec<Uuid> = admins
            .into_iter()
            .filter(|admin| *admin != action.initiated_by)
            .collect();
        if recipients.is_empty() {
            return;
        }

        let notice = Notice::new(
            "admin_action",
            "New admin action requires approval",
            format!(
                "{} proposed on {}. Reason: {}",
                action.action_type,
                action.target.as_str(),
                action.reason
            ),
        )
        .about("admin_action", action.id);

        if let Err(err) = self.notifier.notify(&recipients, notice).await {
            warn!(action_id = %action.id, "admin action notification failed: {err}");
        }
    }
}

fn validate_kind(kind: &AdminActionKind) -> Result<(), CoreError> {
    match kind {
        AdminActionKind::SetMemberActive { .. } => Ok(()),
        AdminActionKind::DecideLoan {
            approved_amount, ..
        } => {
            if let Some(amount) = approved_amount {
                if *amount <= Decimal::ZERO {
                    return Err(CoreError::validation("approved_amount must be positive"));
                }
            }
            Ok(())
        }
        AdminActionKind::CompletePayment { reference } => {
            if reference.trim().is_empty() {
                return Err(CoreError::validation("transaction reference is required"));
            }
            Ok(())
        }
    }
}

/// Runs the ratified action's effect inside the deciding transaction.
/// Legacy rows with unknown targets or unparseable payloads are logged
/// and skipped; the approval itself still stands.
async fn execute_effect(
    tx: &mut (dyn StoreTx + '_),
    action: &AdminAction,
) -> Result<(), CoreError> {
    match (&action.target, &action.kind) {
        (ActionTarget::Member, Some(AdminActionKind::SetMemberActive { active })) => {
            tx.set_member_active(action.entity_id, *active).await
        }
        (
            ActionTarget::Loan,
            Some(AdminActionKind::DecideLoan {
                approve,
                approved_amount,
            }),
        ) => {
            let loan = tx
                .loan_for_update(action.entity_id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("loan {}", action.entity_id)))?;
            if *approve {
                let amount = approved_amount.unwrap_or(loan.requested_amount);
                let balance = loan.balance_with_interest(amount);
                tx.approve_loan(loan.id, amount, balance).await
            } else {
                tx.set_loan_status(loan.id, LoanStatus::Rejected).await?;
                tx.set_loan_route(loan.id, loan.workflow_id, None).await
            }
        }
        (
            ActionTarget::PaymentTransaction,
            Some(AdminActionKind::CompletePayment { reference }),
        ) => {
            // Conditional update; a transaction already completed through
            // the gateway callback makes this a no-op.
            tx.settle_transaction(reference).await?;
            Ok(())
        }
        (target, kind) => {
            warn!(
                action_id = %action.id,
                target = target.as_str(),
                has_payload = kind.is_some(),
                "skipping action with unknown target or unreadable payload"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sacco_core::models::{Member, PaymentTransaction, TransactionStatus};
    use sacco_memstore::{FailingNotifier, InMemoryRoles, InMemoryStore, RecordingNotifier};

    fn member(active: bool) -> Member {
        Member {
            id: Uuid::new_v4(),
            full_name: "Test Member".to_string(),
            email: "member@example.com".to_string(),
            phone: "254700000000".to_string(),
            active,
            created_at: Utc::now(),
        }
    }

    async fn service_with_admins(
        store: &InMemoryStore,
        admins: &[Uuid],
    ) -> ConsensusActionService {
        let roles = Arc::new(InMemoryRoles::new());
        for admin in admins {
            roles.grant(*admin, ADMIN_ROLE).await;
        }
        ConsensusActionService::new(
            Arc::new(store.clone()),
            roles,
            Arc::new(RecordingNotifier::new()),
        )
    }

    #[tokio::test]
    async fn second_approval_resolves_and_executes_once() {
        let store = InMemoryStore::new();
        let target = member(true);
        store.seed_member(target.clone()).await;

        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let service = service_with_admins(&store, &[a, b, c]).await;

        let action = service
            .initiate(
                a,
                target.id,
                "policy violation",
                AdminActionKind::SetMemberActive { active: false },
            )
            .await
            .unwrap();

        let first = service
            .verify(action.id, b, ApprovalDecision::Approved, None)
            .await
            .unwrap();
        assert_eq!(first.status, ActionStatus::Pending);
        assert_eq!(first.approvals, 1);
        // not deactivated yet
        assert!(store.member(target.id).await.unwrap().active);

        let second = service
            .verify(action.id, c, ApprovalDecision::Approved, None)
            .await
            .unwrap();
        assert_eq!(second.status, ActionStatus::Approved);
        assert_eq!(second.approvals, 2);
        assert!(!store.member(target.id).await.unwrap().active);

        // the action is terminal; a late vote cannot re-trigger the effect
        let late = service
            .verify(action.id, Uuid::new_v4(), ApprovalDecision::Approved, None)
            .await;
        assert!(matches!(late, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn initiator_cannot_verify_own_action() {
        let store = InMemoryStore::new();
        let target = member(true);
        store.seed_member(target.clone()).await;

        let a = Uuid::new_v4();
        let service = service_with_admins(&store, &[a]).await;
        let action = service
            .initiate(
                a,
                target.id,
                "cleanup",
                AdminActionKind::SetMemberActive { active: false },
            )
            .await
            .unwrap();

        let result = service
            .verify(action.id, a, ApprovalDecision::Approved, None)
            .await;
        assert!(matches!(result, Err(CoreError::Authorization(_))));
        assert!(store.verifications_for(action.id).await.is_empty());
    }

    #[tokio::test]
    async fn double_voting_is_rejected() {
        let store = InMemoryStore::new();
        let target = member(true);
        store.seed_member(target.clone()).await;

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let service = service_with_admins(&store, &[a, b]).await;
        let action = service
            .initiate(
                a,
                target.id,
                "cleanup",
                AdminActionKind::SetMemberActive { active: false },
            )
            .await
            .unwrap();

        service
            .verify(action.id, b, ApprovalDecision::Approved, None)
            .await
            .unwrap();
        let again = service
            .verify(action.id, b, ApprovalDecision::Rejected, None)
            .await;
        assert!(matches!(again, Err(CoreError::Authorization(_))));
        assert_eq!(store.verifications_for(action.id).await.len(), 1);
    }

    #[tokio::test]
    async fn two_rejections_close_the_action_without_effect() {
        let store = InMemoryStore::new();
        let target = member(true);
        store.seed_member(target.clone()).await;

        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let service = service_with_admins(&store, &[a, b, c]).await;
        let action = service
            .initiate(
                a,
                target.id,
                "suspicious activity",
                AdminActionKind::SetMemberActive { active: false },
            )
            .await
            .unwrap();

        service
            .verify(action.id, b, ApprovalDecision::Rejected, Some("insufficient evidence"))
            .await
            .unwrap();
        let outcome = service
            .verify(action.id, c, ApprovalDecision::Rejected, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, ActionStatus::Rejected);
        assert_eq!(outcome.rejections, 2);
        assert!(store.member(target.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn completes_payment_transaction_conditionally() {
        let store = InMemoryStore::new();
        store
            .seed_transaction(PaymentTransaction {
                id: Uuid::new_v4(),
                member_id: Uuid::new_v4(),
                amount: dec!(5000),
                kind: "deposit".to_string(),
                reference: "MANUAL-1".to_string(),
                status: TransactionStatus::Pending,
                allocation: None,
                created_at: Utc::now(),
                completed_at: None,
            })
            .await;

        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let service = service_with_admins(&store, &[a, b, c]).await;
        let action = service
            .initiate(
                a,
                Uuid::new_v4(),
                "manual deposit slip verified",
                AdminActionKind::CompletePayment {
                    reference: "MANUAL-1".to_string(),
                },
            )
            .await
            .unwrap();

        service
            .verify(action.id, b, ApprovalDecision::Approved, None)
            .await
            .unwrap();
        service
            .verify(action.id, c, ApprovalDecision::Approved, None)
            .await
            .unwrap();

        let transaction = store
            .transaction_by_reference("MANUAL-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transaction.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn legacy_action_with_unknown_target_approves_without_effect() {
        let store = InMemoryStore::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let service = service_with_admins(&store, &[a, b, c]).await;

        // Seeded directly, the way a legacy row would surface from the
        // database after a schema migration.
        let action = AdminAction {
            id: Uuid::new_v4(),
            initiated_by: a,
            action_type: "update".to_string(),
            target: ActionTarget::Unknown("document".to_string()),
            entity_id: Uuid::new_v4(),
            reason: "pre-migration row".to_string(),
            kind: None,
            status: ActionStatus::Pending,
            created_at: Utc::now(),
        };
        store.seed_action(action.clone()).await;

        service
            .verify(action.id, b, ApprovalDecision::Approved, None)
            .await
            .unwrap();
        let outcome = service
            .verify(action.id, c, ApprovalDecision::Approved, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, ActionStatus::Approved);
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_initiation() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        let roles = Arc::new(InMemoryRoles::new());
        roles.grant(a, ADMIN_ROLE).await;
        roles.grant(Uuid::new_v4(), ADMIN_ROLE).await;
        let service = ConsensusActionService::new(
            Arc::new(store.clone()),
            roles,
            Arc::new(FailingNotifier),
        );

        let action = service
            .initiate(
                a,
                Uuid::new_v4(),
                "deactivate dormant account",
                AdminActionKind::SetMemberActive { active: false },
            )
            .await
            .unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
    }
}
