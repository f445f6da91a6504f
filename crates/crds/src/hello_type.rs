//! HelloType CRD
//!
//! A minimal desired-state object: a message the controller acknowledges
//! in status once it has observed the current generation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "sample.microscaler.io",
    version = "v1",
    kind = "HelloType",
    plural = "hellotypes",
    shortname = "hello",
    namespaced,
    status = "HelloTypeStatus",
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".spec.message"}"#,
    printcolumn = r#"{"name":"Observed","type":"integer","jsonPath":".status.observedGeneration"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelloTypeSpec {
    /// Message to be acknowledged by the controller
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloTypeStatus {
    /// Generation of the spec last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Message as last acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

impl HelloType {
    /// Returns true when the status already reflects the current spec generation.
    pub fn is_observed(&self) -> bool {
        match (&self.status, self.metadata.generation) {
            (Some(status), Some(generation)) => status.observed_generation == Some(generation),
            _ => false,
        }
    }
}
