pub mod invoicing;
pub mod numbering;
pub mod rating;

pub use invoicing::{InvoicingEngine, InvoicingOperations, NullTaxCalculator, TaxCalculator};
pub use numbering::InvoiceNumberer;
pub use rating::{RatingEngine, RatingOperations};
