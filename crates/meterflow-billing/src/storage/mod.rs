pub mod cycles;
pub mod invoices;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod rating;
pub mod subscriptions;
pub mod usage;

pub use cycles::{CycleRepository, SqlCycleRepository};

pub use invoices::{InvoiceRepository, SqlInvoiceRepository};

pub use ledger::{LedgerRepository, SqlLedgerRepository};

pub use postgres::PgConnection;

pub use rating::{RatingRepository, SqlRatingRepository};

pub use subscriptions::{SqlSubscriptionRepository, SubscriptionRepository};

pub use usage::{SqlUsageRepository, UsageEvent, UsageRepository};

pub use memory::{
    InMemoryCycleRepository, InMemoryInvoiceRepository, InMemoryLedgerRepository,
    InMemoryRatingRepository, InMemorySubscriptionRepository, InMemoryUsageRepository,
};
