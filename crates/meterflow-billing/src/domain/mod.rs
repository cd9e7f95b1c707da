pub mod cycle;
pub mod invoice;
pub mod ledger;
pub mod pricing;
pub mod rating;
pub mod subscription;
pub mod types;

pub use cycle::BillingCycle;
pub use invoice::{format_invoice_number, Invoice, InvoiceItem, InvoiceStatus, InvoiceTaxLine};
pub use ledger::{AccountCode, AccountKind, Direction, LedgerEntry, LedgerEntryLine};
pub use pricing::{resolve_amount, Price, PriceAmount, PriceTier, PricedLine, PricingModel};
pub use rating::RatingResult;
pub use subscription::{
    BillingMode, CollectionMode, Subscription, SubscriptionItem, SubscriptionStatus,
};
pub use types::{
    Amount, BillingInterval, Currency, CycleId, CycleState, Environment, EntryId, IntervalUnit,
    InvoiceId, MeterCode, PriceId, SubscriptionId, SubscriptionItemId, TenantId,
};
