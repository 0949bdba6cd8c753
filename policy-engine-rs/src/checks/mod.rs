//! Built-in policy checks.

pub mod claim_verification;
pub mod completeness;
pub mod external_reference;
pub mod impact;
pub mod resource_efficiency;
pub mod scope;
