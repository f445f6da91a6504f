//! Resource keys.
//!
//! The work queue carries keys, never objects: by the time a key is processed the
//! object may have changed or disappeared, so reconcilers look it up again.

use std::fmt;
use std::str::FromStr;

use kube::Resource;

use crate::error::KeyError;

/// Canonical `<namespace>/<name>` (or `<name>` for cluster-scoped objects) identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Builds a key from its parts. An empty namespace means cluster-scoped.
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}/{name}")),
            _ => Self(name.to_string()),
        }
    }

    /// Parses `<namespace>/<name>` or `<name>`.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let valid = match key.split_once('/') {
            Some((ns, name)) => !ns.is_empty() && !name.is_empty() && !name.contains('/'),
            None => !key.is_empty(),
        };
        if valid {
            Ok(Self(key.to_string()))
        } else {
            Err(KeyError::Invalid(key.to_string()))
        }
    }

    /// Derives the key of a cluster object from its metadata.
    pub fn from_object<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = meta.name.as_deref().ok_or(KeyError::MissingName)?;
        Ok(Self::new(meta.namespace.as_deref(), name))
    }

    /// Namespace part, `None` for cluster-scoped keys.
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    /// Name part.
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }

    /// The full key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_namespaced_key() {
        let key = ResourceKey::new(Some("ns"), "obj1");
        assert_eq!(key.as_str(), "ns/obj1");
        assert_eq!(key.namespace(), Some("ns"));
        assert_eq!(key.name(), "obj1");
        assert_eq!(key.to_string(), "ns/obj1");
    }

    #[test]
    fn test_cluster_scoped_key() {
        let key = ResourceKey::new(None, "obj1");
        assert_eq!(key.as_str(), "obj1");
        assert_eq!(key.namespace(), None);
        assert_eq!(key.name(), "obj1");
        assert_eq!(ResourceKey::new(Some(""), "obj1"), key);
    }

    #[test]
    fn test_parse() {
        assert_eq!(ResourceKey::parse("ns/obj1").unwrap(), ResourceKey::new(Some("ns"), "obj1"));
        assert_eq!("obj1".parse::<ResourceKey>().unwrap(), ResourceKey::new(None, "obj1"));

        for bad in ["", "/obj1", "ns/", "a/b/c"] {
            assert_eq!(ResourceKey::parse(bad), Err(KeyError::Invalid(bad.to_string())), "{bad}");
        }
    }

    #[test]
    fn test_from_object() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("obj1".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(ResourceKey::from_object(&cm).unwrap().as_str(), "ns/obj1");

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(ResourceKey::from_object(&ns).unwrap().as_str(), "ns");

        assert_eq!(ResourceKey::from_object(&ConfigMap::default()), Err(KeyError::MissingName));
    }
}
