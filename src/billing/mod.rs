//! Subscription plans, entitlement checks, free-plan counters and renewal.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod gate;
pub mod gateway;
pub mod limits;
pub mod renewal;

pub use gate::SubscriptionGate;
pub use gateway::{ChargeOutcome, ChargeRequest, PaymentGateway, YooKassaGateway};
pub use limits::{LimitKind, LimitState, UsageLimiter};
pub use renewal::{RenewalReport, Renewer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Plan {
    Free,
    Month,
    Quarter,
    HalfYear,
    Year,
}

impl Plan {
    pub const PAID: &'static [Plan] = &[Plan::Month, Plan::Quarter, Plan::HalfYear, Plan::Year];

    pub fn months(self) -> u32 {
        match self {
            Plan::Free => 0,
            Plan::Month => 1,
            Plan::Quarter => 3,
            Plan::HalfYear => 6,
            Plan::Year => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Month => "month",
            Plan::Quarter => "quarter",
            Plan::HalfYear => "half_year",
            Plan::Year => "year",
        }
    }
}

/// Groups of capabilities a plan may unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    Premium,
    Ai,
    Family,
}

impl FeatureSet {
    pub fn eligible_plans(self) -> &'static [Plan] {
        match self {
            FeatureSet::Premium | FeatureSet::Ai | FeatureSet::Family => Plan::PAID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Expired,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub family_id: Uuid,
    pub plan_type: Plan,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub amount: i64,
    pub auto_renew: bool,
    #[serde(skip_serializing)]
    pub payment_token: Option<String>,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub last_payment_id: Option<String>,
}

impl Subscription {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_date > now
    }

    /// End of the next cycle; `None` for the free plan.
    pub fn next_end_date(&self) -> Option<DateTime<Utc>> {
        match self.plan_type.months() {
            0 => None,
            months => self.end_date.checked_add_months(Months::new(months)),
        }
    }
}

pub(crate) const SUBSCRIPTION_COLUMNS: &str = "id, family_id, plan_type, status, start_date, end_date, amount, \
     auto_renew, payment_token, last_payment_date, last_payment_id";

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn subscription(plan: Plan, end: DateTime<Utc>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            family_id: Uuid::new_v4(),
            plan_type: plan,
            status: SubscriptionStatus::Active,
            start_date: end - chrono::Duration::days(30),
            end_date: end,
            amount: 299,
            auto_renew: true,
            payment_token: Some("tok_x".into()),
            last_payment_date: None,
            last_payment_id: None,
        }
    }

    #[test]
    fn next_cycle_follows_calendar_months() {
        let end = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let next = subscription(Plan::Month, end).next_end_date().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());

        let next = subscription(Plan::Quarter, end).next_end_date().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 4, 30, 12, 0, 0).unwrap());

        assert!(subscription(Plan::Free, end).next_end_date().is_none());
    }

    #[test]
    fn current_requires_active_and_future_end() {
        let now = Utc::now();
        let mut sub = subscription(Plan::Year, now + chrono::Duration::days(1));
        assert!(sub.is_current(now));
        sub.status = SubscriptionStatus::Canceled;
        assert!(!sub.is_current(now));
        sub.status = SubscriptionStatus::Active;
        sub.end_date = now;
        assert!(!sub.is_current(now));
    }

    #[test]
    fn every_feature_is_unlocked_by_paid_plans_only() {
        for feature in [FeatureSet::Premium, FeatureSet::Ai, FeatureSet::Family] {
            assert!(!feature.eligible_plans().contains(&Plan::Free));
            assert!(feature.eligible_plans().contains(&Plan::Month));
        }
    }
}
