//! Worker contracts.
//!
//! Every skill has an immutable pair of schemas registered before any
//! dispatch. Payloads are checked against them in both directions and
//! failures are reported as data ([`Violation`] lists), never as panics.
//!
//! # Module layout
//!
//! - [`schema`]: `Schema`, `FieldSpec`, `FieldShape`, `Violation`
//! - [`registry`]: `ContractRegistry`, `WorkerContract`

pub mod registry;
pub mod schema;

pub use registry::{ContractRegistry, WorkerContract};
pub use schema::{FieldShape, FieldSpec, Schema, Violation};
