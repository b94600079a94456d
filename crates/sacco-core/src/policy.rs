use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Cooperative policy knobs consumed by the allocation waterfall.
/// Amounts are KES.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPolicy {
    /// Price of one share.
    pub share_price: Decimal,
    /// Hard ceiling on shares a member may hold.
    pub max_shares: i64,
    /// Minimum share capital every member is expected to build up.
    pub min_share_capital: Decimal,
    /// Welfare contribution unit deducted per settled payment.
    pub welfare_amount: Decimal,
    /// When set, automatic share purchases stop at the minimum-capital
    /// threshold instead of the hard ceiling.
    pub cap_auto_at_minimum: bool,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            share_price: Decimal::new(1000, 0),
            max_shares: 50,
            min_share_capital: Decimal::new(5000, 0),
            welfare_amount: Decimal::new(300, 0),
            cap_auto_at_minimum: false,
        }
    }
}

impl AllocationPolicy {
    /// Shares needed to reach the minimum capital, rounded up.
    pub fn minimum_shares(&self) -> i64 {
        let exact = self.min_share_capital / self.share_price;
        let mut shares = exact.floor().to_i64().unwrap_or(i64::MAX);
        if exact.fract() > Decimal::ZERO {
            shares += 1;
        }
        shares
    }

    pub fn has_minimum_shares(&self, held: i64) -> bool {
        Decimal::from(held) * self.share_price >= self.min_share_capital
    }

    /// Holding ceiling applied to automatic purchases.
    pub fn auto_purchase_ceiling(&self) -> i64 {
        if self.cap_auto_at_minimum {
            self.max_shares.min(self.minimum_shares())
        } else {
            self.max_shares
        }
    }

    pub fn purchasable(&self, held: i64) -> i64 {
        (self.auto_purchase_ceiling() - held).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minimum_shares_rounds_up() {
        let policy = AllocationPolicy::default();
        assert_eq!(policy.minimum_shares(), 5);

        let odd = AllocationPolicy {
            min_share_capital: dec!(5500),
            ..AllocationPolicy::default()
        };
        assert_eq!(odd.minimum_shares(), 6);
    }

    #[test]
    fn purchasable_respects_ceiling_and_optional_minimum_cap() {
        let policy = AllocationPolicy::default();
        assert_eq!(policy.purchasable(0), 50);
        assert_eq!(policy.purchasable(47), 3);
        assert_eq!(policy.purchasable(50), 0);
        assert_eq!(policy.purchasable(60), 0);

        let capped = AllocationPolicy {
            cap_auto_at_minimum: true,
            ..AllocationPolicy::default()
        };
        assert_eq!(capped.purchasable(0), 5);
        assert_eq!(capped.purchasable(5), 0);
    }

    #[test]
    fn minimum_capital_check_uses_share_value() {
        let policy = AllocationPolicy::default();
        assert!(!policy.has_minimum_shares(4));
        assert!(policy.has_minimum_shares(5));
    }
}
