//! Synchronous quota enforcement on the request path.

pub mod guard;
pub mod validate;

pub use guard::{ConsumptionGuard, GuardConfig};
pub use validate::TokenValidator;
