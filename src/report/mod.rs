//! Report Module
//!
//! The verification report: model and summary, canonical signing, and the
//! append-only report directory.

pub mod model;
pub mod sign;
pub mod store;

pub use model::{Report, ReportBuilder, REPORT_VERSION};
pub use store::ReportStore;
