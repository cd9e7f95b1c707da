use crate::domain::pricing::Price;
use crate::domain::types::{
    BillingInterval, Currency, MeterCode, SubscriptionId, SubscriptionItemId, TenantId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Draft,
    Active,
    Paused,
    Canceled,
    Ended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Draft => "draft",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Ended => "ended",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "paused" => SubscriptionStatus::Paused,
            "canceled" => SubscriptionStatus::Canceled,
            "ended" => SubscriptionStatus::Ended,
            _ => SubscriptionStatus::Draft,
        }
    }

    pub fn is_billable(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

/// How charges on a subscription are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    ChargeAutomatically,
    SendInvoice,
}

/// Whether an item bills a fixed seat count or metered usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    Licensed,
    Metered,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::Licensed => "licensed",
            BillingMode::Metered => "metered",
        }
    }
}

/// One priced line on a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: SubscriptionItemId,
    pub price: Price,
    pub billing_mode: BillingMode,
    /// Seat count for licensed items; ignored for metered items, whose
    /// quantity comes from the usage log.
    pub quantity: Decimal,
    pub meter_code: Option<MeterCode>,
}

impl SubscriptionItem {
    pub fn licensed(price: Price, quantity: Decimal) -> Self {
        Self {
            id: SubscriptionItemId::new(),
            price,
            billing_mode: BillingMode::Licensed,
            quantity,
            meter_code: None,
        }
    }

    pub fn metered(price: Price, meter_code: MeterCode) -> Self {
        Self {
            id: SubscriptionItemId::new(),
            price,
            billing_mode: BillingMode::Metered,
            quantity: Decimal::ZERO,
            meter_code: Some(meter_code),
        }
    }
}

/// A customer subscription as read by the billing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub status: SubscriptionStatus,
    pub currency: Currency,
    pub interval: BillingInterval,
    pub collection_mode: CollectionMode,
    pub start_at: DateTime<Utc>,
    pub items: Vec<SubscriptionItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        tenant_id: TenantId,
        currency: Currency,
        interval: BillingInterval,
        start_at: DateTime<Utc>,
        items: Vec<SubscriptionItem>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            tenant_id,
            status: SubscriptionStatus::Active,
            currency,
            interval,
            collection_mode: CollectionMode::ChargeAutomatically,
            start_at,
            items,
            created_at: now,
            updated_at: now,
        }
    }
}
