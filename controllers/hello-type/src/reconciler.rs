//! HelloType reconciliation.
//!
//! Acknowledges each HelloType by echoing its message into status together with
//! the generation it was taken from. Objects whose status already reflects the
//! current generation produce no writes.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use controller_core::{CacheMirror, Reconcile, ReconcileError, ResourceKey};
use crds::{HelloType, HelloTypeStatus};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info};

/// Writes HelloType status.
///
/// Abstracted so reconcile logic can be tested without an API server.
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Merge-patches the status of `namespace/name`.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HelloTypeStatus,
    ) -> Result<(), kube::Error>;
}

/// [`StatusClient`] backed by the status subresource.
#[derive(Clone)]
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    /// Creates a status writer using `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HelloTypeStatus,
    ) -> Result<(), kube::Error> {
        let api: Api<HelloType> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }
}

/// Status the object should carry, or `None` when it is already up to date.
pub fn desired_status(obj: &HelloType, now: DateTime<Utc>) -> Option<HelloTypeStatus> {
    let acknowledged = obj
        .status
        .as_ref()
        .and_then(|status| status.message.as_deref())
        == Some(obj.spec.message.as_str());
    if acknowledged && (obj.is_observed() || obj.metadata.generation.is_none()) {
        return None;
    }

    Some(HelloTypeStatus {
        observed_generation: obj.metadata.generation,
        message: Some(obj.spec.message.clone()),
        last_reconciled: Some(now),
    })
}

/// Reconciles HelloType objects read from `cache`, writing status through `status`.
pub struct HelloTypeReconciler<C, S> {
    cache: Arc<C>,
    status: S,
}

impl<C, S> HelloTypeReconciler<C, S> {
    /// Creates a reconciler over `cache` and `status`.
    pub fn new(cache: Arc<C>, status: S) -> Self {
        Self { cache, status }
    }
}

#[async_trait]
impl<C, S> Reconcile for HelloTypeReconciler<C, S>
where
    C: CacheMirror<HelloType>,
    S: StatusClient,
{
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let Some(obj) = self.cache.get_by_key(key) else {
            info!(%key, "HelloType deleted, nothing to do");
            return Ok(());
        };

        if obj.spec.message.trim().is_empty() {
            return Err(ReconcileError::permanent(anyhow!(
                "HelloType {key} has an empty spec.message"
            )));
        }

        let Some(status) = desired_status(&obj, Utc::now()) else {
            debug!(%key, generation = ?obj.metadata.generation, "HelloType status is up to date");
            return Ok(());
        };

        let namespace = key.namespace().ok_or_else(|| {
            ReconcileError::permanent(anyhow!("HelloType {key} has no namespace"))
        })?;

        self.status
            .patch_status(namespace, key.name(), &status)
            .await
            .map_err(|e| ReconcileError::retry(anyhow::Error::new(e).context("patch HelloType status")))?;

        info!(
            %key,
            generation = ?status.observed_generation,
            message = %obj.spec.message,
            "acknowledged HelloType"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_core::Informer;
    use crds::HelloTypeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube_runtime::watcher::Event;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingStatusClient {
        patches: Mutex<Vec<(String, String, HelloTypeStatus)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl StatusClient for Arc<RecordingStatusClient> {
        async fn patch_status(
            &self,
            namespace: &str,
            name: &str,
            status: &HelloTypeStatus,
        ) -> Result<(), kube::Error> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(kube::Error::Service("connection refused".into()));
            }
            self.patches
                .lock()
                .unwrap()
                .push((namespace.to_string(), name.to_string(), status.clone()));
            Ok(())
        }
    }

    fn hello(name: &str, message: &str, generation: i64, status: Option<HelloTypeStatus>) -> HelloType {
        HelloType {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: HelloTypeSpec {
                message: message.to_string(),
            },
            status,
        }
    }

    fn acknowledged(message: &str, generation: i64) -> Option<HelloTypeStatus> {
        Some(HelloTypeStatus {
            observed_generation: Some(generation),
            message: Some(message.to_string()),
            last_reconciled: None,
        })
    }

    fn setup(
        objects: Vec<HelloType>,
    ) -> (
        HelloTypeReconciler<Informer<HelloType>, Arc<RecordingStatusClient>>,
        Arc<RecordingStatusClient>,
    ) {
        let informer = Arc::new(Informer::new("hellotypes"));
        informer.apply(Event::Init);
        for obj in objects {
            informer.apply(Event::InitApply(obj));
        }
        informer.apply(Event::InitDone);

        let client = Arc::new(RecordingStatusClient::default());
        (HelloTypeReconciler::new(informer, Arc::clone(&client)), client)
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new(Some("ns"), name)
    }

    #[tokio::test]
    async fn test_missing_object_is_success() {
        let (reconciler, client) = setup(vec![]);
        reconciler.reconcile(&key("obj2")).await.unwrap();
        assert!(client.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_object_gets_status() {
        let (reconciler, client) = setup(vec![hello("obj1", "hello world", 3, None)]);
        reconciler.reconcile(&key("obj1")).await.unwrap();

        let patches = client.patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        let (namespace, name, status) = &patches[0];
        assert_eq!((namespace.as_str(), name.as_str()), ("ns", "obj1"));
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.message.as_deref(), Some("hello world"));
        assert!(status.last_reconciled.is_some());
    }

    #[tokio::test]
    async fn test_up_to_date_object_is_not_patched() {
        let (reconciler, client) = setup(vec![hello("obj1", "hi", 2, acknowledged("hi", 2))]);
        reconciler.reconcile(&key("obj1")).await.unwrap();
        reconciler.reconcile(&key("obj1")).await.unwrap();
        assert!(client.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_generation_is_acknowledged() {
        let (reconciler, client) = setup(vec![hello("obj1", "bye", 3, acknowledged("hi", 2))]);
        reconciler.reconcile(&key("obj1")).await.unwrap();
        assert_eq!(client.patches.lock().unwrap()[0].2.observed_generation, Some(3));
    }

    #[tokio::test]
    async fn test_empty_message_is_permanent() {
        let (reconciler, client) = setup(vec![hello("obj1", "  ", 1, None)]);
        let err = reconciler.reconcile(&key("obj1")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(client.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_patch_failure_is_retried() {
        let (reconciler, client) = setup(vec![hello("obj1", "hi", 1, None)]);
        client.fail.store(true, Ordering::SeqCst);

        let err = reconciler.reconcile(&key("obj1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("patch HelloType status"));
    }

    #[test]
    fn test_desired_status_without_generation() {
        let mut obj = hello("obj1", "hi", 1, acknowledged("hi", 1));
        obj.metadata.generation = None;
        obj.status = Some(HelloTypeStatus {
            observed_generation: None,
            message: Some("hi".to_string()),
            last_reconciled: None,
        });
        assert_eq!(desired_status(&obj, Utc::now()), None);

        obj.spec.message = "changed".to_string();
        let status = desired_status(&obj, Utc::now()).unwrap();
        assert_eq!(status.message.as_deref(), Some("changed"));
    }
}
