//! Update reconciliation: decide which directories to refetch and apply
//! the result to the store.
//!
//! Overlapping reconciles are serialized per directory so a slow targeted
//! update cannot be overtaken by a later full resync (or vice versa): a
//! full resync holds the ordering gate exclusively, a targeted reconcile
//! holds it shared plus a per-directory mutex. Completion order therefore
//! equals start order for any overlapping key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use pal_store::PolicyStore;

use crate::fetcher::PolicyFetcher;
use crate::ClientError;

/// Reconciliation strategy invoked by a subscription runner.
///
/// `directories = None` (or empty) means "all configured directories".
/// Fetch and apply failures propagate to the caller; the reconciler does
/// not retry internally.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, directories: Option<&[String]>) -> Result<(), ClientError>;
}

/// Fetches policy bundles and bulk-applies them to the store.
pub struct PolicyReconciler {
    fetcher: Arc<dyn PolicyFetcher>,
    store: Arc<dyn PolicyStore>,
    all_directories: Vec<String>,
    ordering: RwLock<()>,
    dir_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PolicyReconciler {
    pub fn new(
        fetcher: Arc<dyn PolicyFetcher>,
        store: Arc<dyn PolicyStore>,
        all_directories: Vec<String>,
    ) -> Self {
        Self {
            fetcher,
            store,
            all_directories,
            ordering: RwLock::new(()),
            dir_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn dir_lock(&self, dir: &str) -> Arc<Mutex<()>> {
        let mut locks = self.dir_locks.lock().await;
        locks.entry(dir.to_string()).or_default().clone()
    }

    async fn fetch_and_apply(&self, directories: &[String]) -> Result<(), ClientError> {
        info!(?directories, "refetching policy bundle");
        match self.fetcher.fetch_policy_bundle(directories).await? {
            Some(bundle) => {
                debug!(
                    modules = bundle.modules.len(),
                    hash = bundle.hash.as_deref(),
                    "applying policy bundle"
                );
                self.store.set_policies(&bundle).await?;
                Ok(())
            }
            None => {
                debug!(?directories, "no bundle for directories; nothing to apply");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Reconcile for PolicyReconciler {
    async fn reconcile(&self, directories: Option<&[String]>) -> Result<(), ClientError> {
        match directories {
            Some(dirs) if !dirs.is_empty() => {
                let _shared = self.ordering.read().await;
                // Acquire per-directory mutexes in sorted order so two
                // targeted reconciles can never deadlock on each other.
                let mut keys: Vec<&String> = dirs.iter().collect();
                keys.sort();
                keys.dedup();
                let mut guards: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(keys.len());
                for key in keys {
                    guards.push(self.dir_lock(key).await.lock_owned().await);
                }
                self.fetch_and_apply(dirs).await
            }
            _ => {
                let _exclusive = self.ordering.write().await;
                let all = self.all_directories.clone();
                self.fetch_and_apply(&all).await
            }
        }
    }
}

/// Refreshes the base policy-data snapshot into the store. Any data
/// notification or (re)connect triggers a full refresh; there is no
/// per-directory granularity on the data side.
pub struct DataReconciler {
    fetcher: Arc<dyn PolicyFetcher>,
    store: Arc<dyn PolicyStore>,
    data_root: String,
    gate: Mutex<()>,
}

impl DataReconciler {
    pub fn new(
        fetcher: Arc<dyn PolicyFetcher>,
        store: Arc<dyn PolicyStore>,
        data_root: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            store,
            data_root: data_root.into(),
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Reconcile for DataReconciler {
    async fn reconcile(&self, _directories: Option<&[String]>) -> Result<(), ClientError> {
        let _serialized = self.gate.lock().await;
        info!("refetching base policy data");
        let data = self.fetcher.fetch_base_data().await?;
        self.store
            .set_policy_data(data, &self.data_root)
            .await
            .map_err(ClientError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchError;
    use pal_store::{MemoryStore, PolicyBundle, PolicyModule};
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scripted fetcher: records requested directory sets and can delay
    /// individual fetches to exercise ordering.
    struct ScriptedFetcher {
        calls: StdMutex<Vec<Vec<String>>>,
        delay_on: Option<String>,
        fail: bool,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                delay_on: None,
                fail: false,
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PolicyFetcher for ScriptedFetcher {
        async fn fetch_policy_bundle(
            &self,
            directories: &[String],
        ) -> Result<Option<PolicyBundle>, FetchError> {
            if self.fail {
                return Err(FetchError::Status(502));
            }
            if self
                .delay_on
                .as_ref()
                .is_some_and(|d| directories.contains(d))
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.calls.lock().unwrap().push(directories.to_vec());
            Ok(Some(PolicyBundle {
                directories: directories.to_vec(),
                modules: directories
                    .iter()
                    .map(|d| PolicyModule {
                        id: format!("{d}/main.rego"),
                        code: format!("package {d}"),
                    })
                    .collect(),
                data: None,
                hash: Some(format!("h-{}", directories.join("+"))),
                created_at: None,
            }))
        }

        async fn fetch_base_data(&self) -> Result<Value, FetchError> {
            if self.fail {
                return Err(FetchError::Status(502));
            }
            Ok(json!({"base": true}))
        }
    }

    fn reconciler(fetcher: Arc<ScriptedFetcher>) -> (PolicyReconciler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            PolicyReconciler::new(
                fetcher,
                store.clone(),
                vec!["authz".into(), "rbac".into()],
            ),
            store,
        )
    }

    #[tokio::test]
    async fn omitted_directories_resolve_to_the_full_configured_set() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let (rec, store) = reconciler(fetcher.clone());
        rec.reconcile(None).await.unwrap();
        assert_eq!(fetcher.calls(), vec![vec!["authz".to_string(), "rbac".to_string()]]);
        let ids = store.list_policy_ids().await.unwrap();
        assert_eq!(ids, vec!["authz/main.rego", "rbac/main.rego"]);
    }

    #[tokio::test]
    async fn targeted_reconcile_fetches_only_that_directory() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let (rec, store) = reconciler(fetcher.clone());
        rec.reconcile(Some(&["authz".to_string()])).await.unwrap();
        assert_eq!(fetcher.calls(), vec![vec!["authz".to_string()]]);
        assert_eq!(store.list_policy_ids().await.unwrap(), vec!["authz/main.rego"]);
    }

    #[tokio::test]
    async fn fetch_failures_propagate_without_touching_the_store() {
        let mut fetcher = ScriptedFetcher::new();
        fetcher.fail = true;
        let (rec, store) = reconciler(Arc::new(fetcher));
        let err = rec.reconcile(None).await.unwrap_err();
        assert!(matches!(err, ClientError::Fetch(FetchError::Status(502))));
        assert!(store.list_policy_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlapping_reconciles_complete_in_start_order() {
        let mut fetcher = ScriptedFetcher::new();
        // Slow down the targeted fetch so a racing full resync would
        // overtake it if nothing serialized them.
        fetcher.delay_on = Some("authz".to_string());
        let fetcher = Arc::new(fetcher);
        let (rec, store) = reconciler(fetcher.clone());
        let rec = Arc::new(rec);

        let slow = {
            let rec = rec.clone();
            tokio::spawn(async move { rec.reconcile(Some(&["authz".to_string()])).await })
        };
        // Give the targeted reconcile a head start before the full resync.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let full = {
            let rec = rec.clone();
            tokio::spawn(async move { rec.reconcile(None).await })
        };

        slow.await.unwrap().unwrap();
        full.await.unwrap().unwrap();

        assert_eq!(
            fetcher.calls(),
            vec![
                vec!["authz".to_string()],
                vec!["authz".to_string(), "rbac".to_string()],
            ]
        );
        // The full resync finished last, so its version is current.
        assert_eq!(
            store.get_policy_version().await.unwrap().as_deref(),
            Some("h-authz+rbac")
        );
    }

    #[tokio::test]
    async fn data_reconciler_writes_base_data_under_its_root() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let store = Arc::new(MemoryStore::new());
        let rec = DataReconciler::new(fetcher, store.clone(), "static");
        rec.reconcile(None).await.unwrap();
        assert_eq!(store.get_data("static/base").await.unwrap(), json!(true));
    }
}
