use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use sacco_core::errors::CoreError;
use sacco_core::external::{Notice, Notifier};
use sacco_core::models::{
    AllocationBreakdown, IncomeEntry, LoanRepayment, SavingsDeposit, SharePurchase,
    TransactionStatus, WelfarePayment,
};
use sacco_core::policy::AllocationPolicy;
use sacco_core::storage::Store;

/// Result of settling a payment against a member's obligations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllocationOutcome {
    /// This call won the settlement and performed the allocation.
    Settled(AllocationBreakdown),
    /// The reference was settled earlier; nothing was changed.
    AlreadySettled,
}

/// Read-only view of where a member's money has gone.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationSummary {
    pub member_id: Uuid,
    pub outstanding_loans: Decimal,
    pub active_loan_count: usize,
    pub shares_held: i64,
    pub share_value: Decimal,
    pub savings_total: Decimal,
    pub has_minimum_shares: bool,
}

/// Splits a settled payment across the member's obligations in fixed
/// priority order: loans oldest first, then one welfare unit, then shares
/// up to the holding ceiling, then savings. Settlement is keyed on the
/// gateway reference, so redelivered callbacks are no-ops.
pub struct AllocationEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    policy: AllocationPolicy,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, policy: AllocationPolicy) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    pub async fn allocate(
        &self,
        member_id: Uuid,
        total_amount: Decimal,
        reference: &str,
    ) -> Result<AllocationOutcome, CoreError> {
        if total_amount <= Decimal::ZERO {
            return Err(CoreError::validation("payment amount must be positive"));
        }

        let existing = self
            .store
            .transaction_by_reference(reference)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("transaction {reference}")))?;
        match existing.status {
            TransactionStatus::Completed => return Ok(AllocationOutcome::AlreadySettled),
            TransactionStatus::Failed => {
                return Err(CoreError::conflict("transaction already marked failed"));
            }
            TransactionStatus::Pending => {}
        }
        if existing.member_id != member_id {
            return Err(CoreError::validation("transaction belongs to another member"));
        }
        if existing.amount != total_amount {
            return Err(CoreError::validation(format!(
                "callback amount {total_amount} does not match initiated amount {}",
                existing.amount
            )));
        }

        let mut tx = self.store.begin().await?;

        // Conditional pending->completed flip; a concurrent duplicate
        // callback loses here and changes nothing.
        if tx.settle_transaction(reference).await?.is_none() {
            return Ok(AllocationOutcome::AlreadySettled);
        }

        let mut remaining = total_amount;
        let mut breakdown = AllocationBreakdown::default();

        for loan in tx.active_loans(member_id).await? {
            if remaining <= Decimal::ZERO {
                break;
            }
            let pay = remaining.min(loan.balance_remaining);
            if pay <= Decimal::ZERO {
                continue;
            }
            // The balance carries flat interest, so the principal portion
            // of any payment is pay / factor; interest is the remainder,
            // keeping the two parts summing exactly to pay.
            let principal = (pay / loan.interest_factor()).round_dp(2);
            let interest = pay - principal;

            let new_balance = tx.apply_repayment(loan.id, pay).await?;
            tx.insert_repayment(&LoanRepayment {
                id: Uuid::new_v4(),
                loan_id: loan.id,
                amount: pay,
                principal,
                interest,
                reference: reference.to_string(),
                created_at: Utc::now(),
            })
            .await?;
            if interest > Decimal::ZERO {
                tx.insert_income(&IncomeEntry {
                    id: Uuid::new_v4(),
                    amount: interest,
                    source: "loan_interest".to_string(),
                    description: format!("Interest portion of repayment {reference}"),
                    created_at: Utc::now(),
                })
                .await?;
            }
            if new_balance <= Decimal::ZERO {
                tx.mark_loan_paid(loan.id).await?;
                let released = tx.release_guarantors(loan.id).await?;
                info!(loan_id = %loan.id, released, "loan fully repaid");
            }

            breakdown.loan_principal += principal;
            breakdown.loan_interest += interest;
            remaining -= pay;
        }

        if remaining >= self.policy.welfare_amount && self.policy.welfare_amount > Decimal::ZERO {
            tx.insert_welfare_payment(&WelfarePayment {
                id: Uuid::new_v4(),
                member_id,
                amount: self.policy.welfare_amount,
                reference: format!("{reference}_WELFARE"),
                created_at: Utc::now(),
            })
            .await?;
            breakdown.welfare = self.policy.welfare_amount;
            remaining -= self.policy.welfare_amount;
        }

        if self.policy.share_price > Decimal::ZERO && remaining >= self.policy.share_price {
            let held = tx.shares_held(member_id).await?;
            let slots = self.policy.purchasable(held);
            let affordable = (remaining / self.policy.share_price)
                .floor()
                .to_i64()
                .unwrap_or(0);
            let quantity = affordable.min(slots);
            if quantity > 0 {
                let cost = Decimal::from(quantity) * self.policy.share_price;
                tx.insert_share_purchase(&SharePurchase {
                    id: Uuid::new_v4(),
                    member_id,
                    quantity: quantity as i32,
                    amount_paid: cost,
                    created_at: Utc::now(),
                })
                .await?;
                breakdown.shares = cost;
                remaining -= cost;
            }
        }

        if remaining > Decimal::ZERO {
            tx.insert_savings_deposit(&SavingsDeposit {
                id: Uuid::new_v4(),
                member_id,
                amount: remaining,
                reference: reference.to_string(),
                created_at: Utc::now(),
            })
            .await?;
            breakdown.savings = remaining;
        }

        // Dropping the transaction on this error path rolls everything
        // back, including the settlement flip.
        if breakdown.total() != total_amount {
            return Err(CoreError::system(format!(
                "allocation of {reference} split {} out of {total_amount}",
                breakdown.total()
            )));
        }

        tx.record_allocation(reference, &breakdown).await?;
        tx.commit().await?;

        let notice = Notice::new(
            "payment_allocated",
            "Payment received",
            format!(
                "Your payment of KSh {total_amount} was received. Loan: KSh {}, welfare: KSh {}, shares: KSh {}, savings: KSh {}.",
                breakdown.loan(),
                breakdown.welfare,
                breakdown.shares,
                breakdown.savings
            ),
        )
        .about("payment_transaction", existing.id);
        if let Err(err) = self.notifier.notify(&[member_id], notice).await {
            warn!(reference, "allocation notification failed: {err}");
        }

        Ok(AllocationOutcome::Settled(breakdown))
    }

    /// Marks a pending transaction failed after a gateway rejection.
    pub async fn fail(&self, reference: &str) -> Result<(), CoreError> {
        let mut tx = self.store.begin().await?;
        if !tx.fail_transaction(reference).await? {
            // settled or unknown, either way not ours to fail
            warn!(reference, "ignoring failure callback for non-pending transaction");
            return Ok(());
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn summary(&self, member_id: Uuid) -> Result<AllocationSummary, CoreError> {
        let loans = self.store.active_loans(member_id).await?;
        let outstanding = loans.iter().map(|loan| loan.balance_remaining).sum();
        let shares = self.store.shares_held(member_id).await?;
        Ok(AllocationSummary {
            member_id,
            outstanding_loans: outstanding,
            active_loan_count: loans.len(),
            shares_held: shares,
            share_value: Decimal::from(shares) * self.policy.share_price,
            savings_total: self.store.savings_total(member_id).await?,
            has_minimum_shares: self.policy.has_minimum_shares(shares),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sacco_core::models::{GuarantorStatus, Loan, LoanGuarantor, LoanStatus, PaymentTransaction};
    use sacco_memstore::{InMemoryStore, RecordingNotifier};

    fn engine(store: &InMemoryStore) -> AllocationEngine {
        AllocationEngine::new(
            Arc::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
            AllocationPolicy::default(),
        )
    }

    fn active_loan(member_id: Uuid, balance: Decimal, months: i32) -> Loan {
        Loan {
            id: Uuid::new_v4(),
            borrower_id: member_id,
            requested_amount: balance,
            approved_amount: Some(balance),
            interest_rate: dec!(3),
            repayment_months: months,
            balance_remaining: balance,
            status: LoanStatus::Active,
            workflow_id: None,
            current_step_id: None,
            created_at: Utc::now(),
            approved_at: Some(Utc::now()),
        }
    }

    fn pending_payment(member_id: Uuid, amount: Decimal, reference: &str) -> PaymentTransaction {
        PaymentTransaction {
            id: Uuid::new_v4(),
            member_id,
            amount,
            kind: "contribution".to_string(),
            reference: reference.to_string(),
            status: TransactionStatus::Pending,
            allocation: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn waterfall_clears_loan_then_welfare_shares_savings() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        // 10,000 principal at 3% over one month owes 10,300
        let loan = active_loan(member, dec!(10300), 1);
        store.seed_loan(loan.clone()).await;
        store
            .seed_guarantor(LoanGuarantor {
                id: Uuid::new_v4(),
                loan_id: loan.id,
                guarantor_id: Uuid::new_v4(),
                shares_pledged: 10,
                amount_covered: dec!(10000),
                status: GuarantorStatus::Accepted,
            })
            .await;
        store
            .seed_transaction(pending_payment(member, dec!(20000), "MPESA01"))
            .await;

        let outcome = engine(&store)
            .allocate(member, dec!(20000), "MPESA01")
            .await
            .unwrap();
        let AllocationOutcome::Settled(breakdown) = outcome else {
            panic!("expected a fresh settlement");
        };
        assert_eq!(breakdown.loan_principal, dec!(10000.00));
        assert_eq!(breakdown.loan_interest, dec!(300.00));
        assert_eq!(breakdown.welfare, dec!(300));
        assert_eq!(breakdown.shares, dec!(9000));
        assert_eq!(breakdown.savings, dec!(400));
        assert_eq!(breakdown.total(), dec!(20000));

        let settled = store
            .transaction_by_reference("MPESA01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, TransactionStatus::Completed);
        assert!(settled.completed_at.is_some());
        assert_eq!(settled.allocation, Some(breakdown));

        let paid = store.loan(loan.id).await.unwrap().unwrap();
        assert_eq!(paid.status, LoanStatus::Paid);
        assert_eq!(paid.balance_remaining, dec!(0));
        assert!(store
            .guarantors_for(loan.id)
            .await
            .iter()
            .all(|g| g.status == GuarantorStatus::Released));

        assert_eq!(store.shares_held(member).await.unwrap(), 9);
        assert_eq!(store.savings_total(member).await.unwrap(), dec!(400));
        assert_eq!(store.income_total().await, dec!(300.00));
        assert_eq!(store.welfare_for(member).await.len(), 1);

        let repayments = store.repayments_for(loan.id).await;
        assert_eq!(repayments.len(), 1);
        assert_eq!(repayments[0].amount, dec!(10300));
        assert_eq!(repayments[0].principal, dec!(10000.00));
        assert_eq!(repayments[0].interest, dec!(300.00));
    }

    #[tokio::test]
    async fn redelivered_callback_is_a_no_op() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        store
            .seed_transaction(pending_payment(member, dec!(1500), "MPESA02"))
            .await;

        let svc = engine(&store);
        let first = svc.allocate(member, dec!(1500), "MPESA02").await.unwrap();
        assert!(matches!(first, AllocationOutcome::Settled(_)));

        let second = svc.allocate(member, dec!(1500), "MPESA02").await.unwrap();
        assert!(matches!(second, AllocationOutcome::AlreadySettled));

        // welfare and shares were not double-booked
        assert_eq!(store.welfare_for(member).await.len(), 1);
        assert_eq!(store.shares_held(member).await.unwrap(), 1);
        assert_eq!(store.savings_total(member).await.unwrap(), dec!(200));
    }

    #[tokio::test]
    async fn partial_repayment_keeps_loan_active_and_guarantors_bound() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        let loan = active_loan(member, dec!(10300), 1);
        store.seed_loan(loan.clone()).await;
        store
            .seed_guarantor(LoanGuarantor {
                id: Uuid::new_v4(),
                loan_id: loan.id,
                guarantor_id: Uuid::new_v4(),
                shares_pledged: 5,
                amount_covered: dec!(5000),
                status: GuarantorStatus::Accepted,
            })
            .await;
        store
            .seed_transaction(pending_payment(member, dec!(5000), "MPESA03"))
            .await;

        let outcome = engine(&store)
            .allocate(member, dec!(5000), "MPESA03")
            .await
            .unwrap();
        let AllocationOutcome::Settled(breakdown) = outcome else {
            panic!("expected a fresh settlement");
        };
        // everything went to the loan, nothing further down the waterfall
        assert_eq!(breakdown.loan(), dec!(5000));
        assert_eq!(breakdown.welfare, dec!(0));
        assert_eq!(breakdown.savings, dec!(0));

        let open = store.loan(loan.id).await.unwrap().unwrap();
        assert_eq!(open.status, LoanStatus::Active);
        assert_eq!(open.balance_remaining, dec!(5300));
        assert!(store
            .guarantors_for(loan.id)
            .await
            .iter()
            .all(|g| g.status == GuarantorStatus::Accepted));
    }

    #[tokio::test]
    async fn oldest_loan_is_paid_first() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        let mut older = active_loan(member, dec!(2060), 1);
        older.created_at = Utc::now() - chrono::Duration::days(30);
        let newer = active_loan(member, dec!(3090), 1);
        store.seed_loan(older.clone()).await;
        store.seed_loan(newer.clone()).await;
        store
            .seed_transaction(pending_payment(member, dec!(3000), "MPESA04"))
            .await;

        engine(&store)
            .allocate(member, dec!(3000), "MPESA04")
            .await
            .unwrap();

        let first = store.loan(older.id).await.unwrap().unwrap();
        assert_eq!(first.status, LoanStatus::Paid);
        let second = store.loan(newer.id).await.unwrap().unwrap();
        assert_eq!(second.status, LoanStatus::Active);
        assert_eq!(second.balance_remaining, dec!(2150));
    }

    #[tokio::test]
    async fn zero_share_price_sends_remainder_to_savings() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        store
            .seed_transaction(pending_payment(member, dec!(1500), "MPESA09"))
            .await;

        let engine = AllocationEngine::new(
            Arc::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
            AllocationPolicy {
                share_price: Decimal::ZERO,
                ..AllocationPolicy::default()
            },
        );
        let outcome = engine.allocate(member, dec!(1500), "MPESA09").await.unwrap();
        let AllocationOutcome::Settled(breakdown) = outcome else {
            panic!("expected a fresh settlement");
        };
        assert_eq!(breakdown.welfare, dec!(300));
        assert_eq!(breakdown.shares, dec!(0));
        assert_eq!(breakdown.savings, dec!(1200));
        assert_eq!(store.shares_held(member).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn welfare_skipped_when_remainder_is_short() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        store
            .seed_transaction(pending_payment(member, dec!(250), "MPESA05"))
            .await;

        let outcome = engine(&store)
            .allocate(member, dec!(250), "MPESA05")
            .await
            .unwrap();
        let AllocationOutcome::Settled(breakdown) = outcome else {
            panic!("expected a fresh settlement");
        };
        assert_eq!(breakdown.welfare, dec!(0));
        assert_eq!(breakdown.savings, dec!(250));
        assert!(store.welfare_for(member).await.is_empty());
    }

    #[tokio::test]
    async fn share_purchases_stop_at_the_holding_ceiling() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        store
            .seed_share_purchase(SharePurchase {
                id: Uuid::new_v4(),
                member_id: member,
                quantity: 48,
                amount_paid: dec!(48000),
                created_at: Utc::now(),
            })
            .await;
        store
            .seed_transaction(pending_payment(member, dec!(5300), "MPESA06"))
            .await;

        let outcome = engine(&store)
            .allocate(member, dec!(5300), "MPESA06")
            .await
            .unwrap();
        let AllocationOutcome::Settled(breakdown) = outcome else {
            panic!("expected a fresh settlement");
        };
        // only 2 slots remain below the 50-share ceiling
        assert_eq!(breakdown.welfare, dec!(300));
        assert_eq!(breakdown.shares, dec!(2000));
        assert_eq!(breakdown.savings, dec!(3000));
        assert_eq!(store.shares_held(member).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn mismatched_callback_details_are_rejected() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        store
            .seed_transaction(pending_payment(member, dec!(1000), "MPESA07"))
            .await;

        let svc = engine(&store);
        let unknown = svc.allocate(member, dec!(1000), "NOPE").await;
        assert!(matches!(unknown, Err(CoreError::NotFound(_))));

        let wrong_member = svc.allocate(Uuid::new_v4(), dec!(1000), "MPESA07").await;
        assert!(matches!(wrong_member, Err(CoreError::Validation(_))));

        let wrong_amount = svc.allocate(member, dec!(999), "MPESA07").await;
        assert!(matches!(wrong_amount, Err(CoreError::Validation(_))));

        // the transaction is still pending and can settle normally
        let settled = svc.allocate(member, dec!(1000), "MPESA07").await.unwrap();
        assert!(matches!(settled, AllocationOutcome::Settled(_)));
    }

    #[tokio::test]
    async fn failure_callback_closes_only_pending_transactions() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        store
            .seed_transaction(pending_payment(member, dec!(1000), "MPESA08"))
            .await;

        let svc = engine(&store);
        svc.fail("MPESA08").await.unwrap();
        let failed = store
            .transaction_by_reference("MPESA08")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);

        // failed transactions cannot subsequently settle
        let result = svc.allocate(member, dec!(1000), "MPESA08").await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));

        // failing an unknown reference is tolerated
        svc.fail("UNKNOWN").await.unwrap();
    }

    #[tokio::test]
    async fn summary_reflects_ledgers() {
        let store = InMemoryStore::new();
        let member = Uuid::new_v4();
        store.seed_loan(active_loan(member, dec!(5150), 1)).await;
        store
            .seed_transaction(pending_payment(member, dec!(2000), "MPESA09"))
            .await;
        engine(&store)
            .allocate(member, dec!(2000), "MPESA09")
            .await
            .unwrap();

        let summary = engine(&store).summary(member).await.unwrap();
        assert_eq!(summary.outstanding_loans, dec!(3150));
        assert_eq!(summary.active_loan_count, 1);
        assert_eq!(summary.shares_held, 0);
        assert_eq!(summary.savings_total, dec!(0));
        assert!(!summary.has_minimum_shares);
    }
}
