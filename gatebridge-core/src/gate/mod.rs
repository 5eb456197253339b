//! Gate model: requests, status records, the status state machine, and
//! decision-path errors.

pub mod error;
pub mod status;
pub mod types;

pub use error::{GateError, GateErrorKind};
pub use status::GateStatus;
pub use types::{DecisionKind, GateRequest, GateStatusRecord};
