//! Sample Controller CRD Definitions
//!
//! Kubernetes Custom Resource Definitions reconciled by the sample controllers.

pub mod hello_type;

pub use hello_type::*;
