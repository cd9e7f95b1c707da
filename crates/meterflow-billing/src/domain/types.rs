use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier
    TenantId
);
uuid_id!(
    /// Subscription identifier
    SubscriptionId
);
uuid_id!(
    /// Subscription item identifier
    SubscriptionItemId
);
uuid_id!(
    /// Billing cycle identifier
    CycleId
);
uuid_id!(
    /// Invoice identifier
    InvoiceId
);
uuid_id!(
    /// Ledger entry identifier
    EntryId
);
uuid_id!(
    /// Price identifier
    PriceId
);

/// Meter code referencing a usage meter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeterCode(String);

impl MeterCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO-4217 currency code, stored uppercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monetary amount in integer minor units (cents).
///
/// Intermediate pricing arithmetic runs on `Decimal`; every persisted
/// amount is rounded half-up to a whole minor unit first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(i64);

impl Amount {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Round a decimal minor-unit value half-up (away from zero) to a
    /// whole minor unit. Rounding direction is fixed so that re-rating a
    /// cycle reproduces identical amounts.
    pub fn round(value: Decimal) -> Self {
        let rounded = value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        Self(rounded.try_into().unwrap_or(i64::MAX))
    }

    pub fn as_minor(&self) -> i64 {
        self.0
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }

    pub fn add(&self, other: Amount) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc.add(a))
    }
}

/// Billing interval unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
}

/// A subscription's billing interval: one period spans `count` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingInterval {
    pub unit: IntervalUnit,
    pub count: u32,
}

impl BillingInterval {
    pub fn new(unit: IntervalUnit, count: u32) -> Self {
        Self {
            unit,
            count: count.max(1),
        }
    }

    pub fn monthly() -> Self {
        Self::new(IntervalUnit::Month, 1)
    }

    /// The end of a period starting at `start`: the start advanced by one
    /// billing interval. Month arithmetic clamps to month ends.
    pub fn advance(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self.unit {
            IntervalUnit::Day => start + Duration::days(i64::from(self.count)),
            IntervalUnit::Week => start + Duration::weeks(i64::from(self.count)),
            IntervalUnit::Month => start + Months::new(self.count),
            IntervalUnit::Year => start + Months::new(12 * self.count),
        }
    }

    /// Scale factor applied to a flat price for this billing interval.
    /// These are the MRR-normalization factors, 30-day calendar
    /// approximation included; do not "correct" them, invoice totals
    /// depend on the exact values.
    pub fn proration_factor(&self) -> Decimal {
        let count = Decimal::from(self.count);
        match self.unit {
            IntervalUnit::Month => Decimal::ONE,
            IntervalUnit::Year => Decimal::ONE / (Decimal::from(12) * count),
            IntervalUnit::Week => Decimal::from(30) / (Decimal::from(7) * count),
            IntervalUnit::Day => Decimal::from(30) / count,
        }
    }
}

/// Billing cycle lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Open,
    Closing,
    Closed,
    Error,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Open => "open",
            CycleState::Closing => "closing",
            CycleState::Closed => "closed",
            CycleState::Error => "error",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "closing" => CycleState::Closing,
            "closed" => CycleState::Closed,
            "error" => CycleState::Error,
            _ => CycleState::Open,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Closed)
    }

    /// Legal conditional-write transitions. Closed cycles only leave the
    /// terminal state through the explicitly labeled force-reopen
    /// operation, which is not part of this matrix.
    pub fn can_transition_to(&self, next: CycleState) -> bool {
        matches!(
            (self, next),
            (CycleState::Open, CycleState::Closing)
                | (CycleState::Open, CycleState::Error)
                | (CycleState::Closing, CycleState::Closed)
                | (CycleState::Closing, CycleState::Error)
                | (CycleState::Error, CycleState::Closing)
        )
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime environment, gates the dangerous operational surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
            Environment::Development => write!(f, "development"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_rounding_half_up() {
        assert_eq!(Amount::round(dec!(139.5)).as_minor(), 140);
        assert_eq!(Amount::round(dec!(139.4)).as_minor(), 139);
        assert_eq!(Amount::round(dec!(-10.5)).as_minor(), -11);
        assert_eq!(Amount::round(dec!(0.49)).as_minor(), 0);
    }

    #[test]
    fn test_cycle_state_transitions() {
        assert!(CycleState::Open.can_transition_to(CycleState::Closing));
        assert!(CycleState::Closing.can_transition_to(CycleState::Closed));
        assert!(CycleState::Open.can_transition_to(CycleState::Error));
        assert!(CycleState::Closing.can_transition_to(CycleState::Error));
        assert!(CycleState::Error.can_transition_to(CycleState::Closing));

        assert!(!CycleState::Closed.can_transition_to(CycleState::Open));
        assert!(!CycleState::Open.can_transition_to(CycleState::Closed));
        assert!(!CycleState::Error.can_transition_to(CycleState::Open));
    }

    #[test]
    fn test_interval_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();

        let monthly = BillingInterval::monthly();
        let end = monthly.advance(start);
        // Clamped to the end of February
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());

        let weekly = BillingInterval::new(IntervalUnit::Week, 2);
        assert_eq!(weekly.advance(start), start + Duration::weeks(2));
    }

    #[test]
    fn test_proration_factors() {
        assert_eq!(BillingInterval::monthly().proration_factor(), Decimal::ONE);
        assert_eq!(
            BillingInterval::new(IntervalUnit::Year, 1).proration_factor(),
            Decimal::ONE / Decimal::from(12)
        );
        assert_eq!(
            BillingInterval::new(IntervalUnit::Week, 1).proration_factor(),
            Decimal::from(30) / Decimal::from(7)
        );
        assert_eq!(
            BillingInterval::new(IntervalUnit::Day, 1).proration_factor(),
            Decimal::from(30)
        );
    }
}
