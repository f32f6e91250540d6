//! In-memory reference backend.
//!
//! Stores module source verbatim and policy data as one JSON tree. It does
//! not evaluate policies (`is_allowed` is unsupported); it exists so the
//! engine, the agent's loopback mode, and the tests have a concrete store
//! without an external process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::{
    AuthorizationDecision, AuthorizationQuery, PolicyBundle, PolicyStore, StoreError,
};

#[derive(Default)]
struct Inner {
    policies: BTreeMap<String, String>,
    version: Option<String>,
    data: Value,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn write_at_path(root: &mut Value, path: &str, data: Value) -> Result<(), StoreError> {
    let mut node = root;
    for seg in segments(path) {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?
            .entry(seg.to_string())
            .or_insert(Value::Null);
    }
    *node = data;
    Ok(())
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn is_allowed(
        &self,
        _query: &AuthorizationQuery,
    ) -> Result<AuthorizationDecision, StoreError> {
        Err(StoreError::Unsupported(
            "memory store holds policy source but cannot evaluate it",
        ))
    }

    async fn set_policy(&self, id: &str, code: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.policies.insert(id.to_string(), code.to_string());
        Ok(())
    }

    async fn get_policy(&self, id: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.policies.get(id).cloned())
    }

    async fn delete_policy(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.policies.remove(id);
        Ok(())
    }

    async fn list_policy_ids(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.policies.keys().cloned().collect())
    }

    async fn set_policies(&self, bundle: &PolicyBundle) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for module in &bundle.modules {
            inner
                .policies
                .insert(module.id.clone(), module.code.clone());
        }
        if let Some(data) = &bundle.data {
            inner.data = data.clone();
        }
        if bundle.hash.is_some() {
            inner.version = bundle.hash.clone();
        }
        Ok(())
    }

    async fn get_policy_version(&self) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.version.clone())
    }

    async fn set_policy_data(&self, data: Value, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if segments(path).next().is_none() {
            inner.data = data;
            return Ok(());
        }
        write_at_path(&mut inner.data, path, data)
    }

    async fn get_data(&self, path: &str) -> Result<Value, StoreError> {
        let inner = self.inner.read().await;
        let mut node = &inner.data;
        for seg in segments(path) {
            match node.get(seg) {
                Some(next) => node = next,
                None => return Ok(Value::Null),
            }
        }
        Ok(node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PolicyModule;
    use serde_json::json;

    fn bundle() -> PolicyBundle {
        PolicyBundle {
            directories: vec!["authz".into()],
            modules: vec![
                PolicyModule {
                    id: "authz/allow.rego".into(),
                    code: "package authz\nallow { true }".into(),
                },
                PolicyModule {
                    id: "authz/deny.rego".into(),
                    code: "package authz\ndeny { false }".into(),
                },
            ],
            data: Some(json!({"roles": {"admin": ["alice"]}})),
            hash: Some("abc123".into()),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn policy_crud_round_trips() {
        let store = MemoryStore::new();
        store.set_policy("p1", "package p1").await.unwrap();
        assert_eq!(store.get_policy("p1").await.unwrap().as_deref(), Some("package p1"));
        assert_eq!(store.list_policy_ids().await.unwrap(), vec!["p1".to_string()]);
        store.delete_policy("p1").await.unwrap();
        assert_eq!(store.get_policy("p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn applying_the_same_bundle_twice_is_idempotent() {
        let store = MemoryStore::new();
        store.set_policies(&bundle()).await.unwrap();
        let ids_once = store.list_policy_ids().await.unwrap();
        let data_once = store.get_data("").await.unwrap();
        let version_once = store.get_policy_version().await.unwrap();

        store.set_policies(&bundle()).await.unwrap();
        assert_eq!(store.list_policy_ids().await.unwrap(), ids_once);
        assert_eq!(store.get_data("").await.unwrap(), data_once);
        assert_eq!(store.get_policy_version().await.unwrap(), version_once);
        assert_eq!(version_once.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn data_paths_nest_and_missing_paths_read_null() {
        let store = MemoryStore::new();
        store
            .set_policy_data(json!({"b": 1}), "a")
            .await
            .unwrap();
        store
            .set_policy_data(json!(true), "a/c/deep")
            .await
            .unwrap();
        assert_eq!(store.get_data("a/b").await.unwrap(), json!(1));
        assert_eq!(store.get_data("a/c/deep").await.unwrap(), json!(true));
        assert_eq!(store.get_data("nope/nothing").await.unwrap(), Value::Null);
        // root write replaces the whole tree
        store.set_policy_data(json!({"fresh": true}), "").await.unwrap();
        assert_eq!(store.get_data("a/b").await.unwrap(), Value::Null);
        assert_eq!(store.get_data("fresh").await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn memory_store_does_not_evaluate_queries() {
        let store = MemoryStore::new();
        let query = AuthorizationQuery {
            user: "alice".into(),
            action: "read".into(),
            resource: Value::Null,
            context: Value::Null,
        };
        assert!(matches!(
            store.is_allowed(&query).await,
            Err(StoreError::Unsupported(_))
        ));
    }
}
