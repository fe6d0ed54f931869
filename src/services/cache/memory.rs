// In-process cache client
//
// Every MemoryCacheClient clone shares one cluster. Caches, stored scripts
// and admin calls live in memory; fault-injection hooks let callers make the
// cluster unreachable or make cache creation fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    AdminFlag, CacheAdmin, CacheClient, CacheClientError, ClientSettings, RemoteCache,
    RemoteCacheManager, ScriptExecutor,
};

/// Caches every cluster defines at startup
const INTERNAL_CACHES: &[&str] = &["___script_cache", "___protobuf_metadata"];

type ScriptTask = Arc<dyn Fn(&HashMap<String, Value>) -> Result<Value, CacheClientError> + Send + Sync>;

/// One recorded `create_cache` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCall {
    pub name: String,
    pub template: Option<String>,
    pub flag: AdminFlag,
}

struct MemoryCache {
    name: String,
    flag: Mutex<AdminFlag>,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryCache {
    fn new(name: &str, flag: AdminFlag) -> Self {
        Self {
            name: name.to_string(),
            flag: Mutex::new(flag),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        lock(&self.entries)
    }
}

#[derive(Default)]
struct Cluster {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
    tasks: RwLock<HashMap<String, ScriptTask>>,
    admin_calls: Mutex<Vec<AdminCall>>,
    failing_creates: Mutex<HashSet<AdminFlag>>,
    credentials: Mutex<Option<(String, String)>>,
    connects: AtomicUsize,
}

/// Cache client backed by process memory
#[derive(Clone)]
pub struct MemoryCacheClient {
    cluster: Arc<Cluster>,
    reachable: Arc<AtomicBool>,
}

impl Default for MemoryCacheClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheClient {
    pub fn new() -> Self {
        let cluster = Cluster::default();
        {
            let mut caches = cluster.caches.write().unwrap_or_else(PoisonError::into_inner);
            for name in INTERNAL_CACHES {
                caches.insert(
                    name.to_string(),
                    Arc::new(MemoryCache::new(name, AdminFlag::Permanent)),
                );
            }
        }
        Self {
            cluster: Arc::new(cluster),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Require these credentials on connect
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        *lock(&self.cluster.credentials) = Some((username.to_string(), password.to_string()));
        self
    }

    /// Define a permanent cache; no-op if it already exists
    pub fn create_cache(&self, name: &str) {
        self.cluster
            .caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::new(name, AdminFlag::Permanent)));
    }

    pub fn has_cache(&self, name: &str) -> bool {
        self.cluster
            .caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn cache_flag(&self, name: &str) -> Option<AdminFlag> {
        self.cluster
            .caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|c| *lock(&c.flag))
    }

    /// Make the cluster (un)reachable for every manager handed out so far
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every subsequent `create_cache` with this flag fail
    pub fn fail_creates(&self, flag: AdminFlag) {
        lock(&self.cluster.failing_creates).insert(flag);
    }

    pub fn admin_calls(&self) -> Vec<AdminCall> {
        lock(&self.cluster.admin_calls).clone()
    }

    pub fn connect_count(&self) -> usize {
        self.cluster.connects.load(Ordering::SeqCst)
    }

    /// Install a server-side task callable through `ScriptExecutor::execute`
    pub fn register_task<F>(&self, name: &str, task: F)
    where
        F: Fn(&HashMap<String, Value>) -> Result<Value, CacheClientError> + Send + Sync + 'static,
    {
        self.cluster
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(task));
    }

    fn check_credentials(&self, settings: &ClientSettings) -> Result<(), CacheClientError> {
        let required = lock(&self.cluster.credentials).clone();
        match required {
            None => Ok(()),
            Some((user, pass)) => {
                let supplied_user = settings.username.as_deref();
                let supplied_pass = settings.password.as_deref();
                if supplied_user == Some(user.as_str()) && supplied_pass == Some(pass.as_str()) {
                    Ok(())
                } else {
                    Err(CacheClientError::Authentication(format!(
                        "invalid credentials for user {:?}",
                        supplied_user.unwrap_or_default()
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl CacheClient for MemoryCacheClient {
    async fn connect(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn RemoteCacheManager>, CacheClientError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CacheClientError::Unavailable(settings.servers.join(",")));
        }
        self.check_credentials(settings)?;
        self.cluster.connects.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(
            "Connected in-memory cache manager ({:?} marshalling)",
            settings.marshalling
        );

        Ok(Arc::new(MemoryCacheManager {
            cluster: Arc::clone(&self.cluster),
            reachable: Arc::clone(&self.reachable),
        }))
    }
}

struct MemoryCacheManager {
    cluster: Arc<Cluster>,
    reachable: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteCacheManager for MemoryCacheManager {
    async fn cache(&self, name: &str) -> Result<Option<Arc<dyn RemoteCache>>, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        let caches = self.cluster.caches.read().unwrap_or_else(PoisonError::into_inner);
        Ok(caches.get(name).map(|cache| {
            Arc::new(MemoryCacheView {
                cache: Arc::clone(cache),
                reachable: Arc::clone(&self.reachable),
            }) as Arc<dyn RemoteCache>
        }))
    }

    fn administration(&self) -> Arc<dyn CacheAdmin> {
        Arc::new(MemoryAdmin {
            cluster: Arc::clone(&self.cluster),
            reachable: Arc::clone(&self.reachable),
        })
    }

    fn scripts(&self) -> Arc<dyn ScriptExecutor> {
        Arc::new(MemoryScripts {
            cluster: Arc::clone(&self.cluster),
            reachable: Arc::clone(&self.reachable),
        })
    }
}

struct MemoryCacheView {
    cache: Arc<MemoryCache>,
    reachable: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteCache for MemoryCacheView {
    fn name(&self) -> &str {
        &self.cache.name
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        Ok(self.cache.entries().get(key).cloned())
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<Option<Vec<u8>>, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        Ok(self.cache.entries().insert(key, value))
    }

    async fn put_if_absent(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        let mut entries = self.cache.entries();
        if let Some(existing) = entries.get(&key) {
            return Ok(Some(existing.clone()));
        }
        entries.insert(key, value);
        Ok(None)
    }

    async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        Ok(self.cache.entries().remove(key))
    }

    async fn contains_key(&self, key: &[u8]) -> Result<bool, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        Ok(self.cache.entries().contains_key(key))
    }

    async fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        Ok(self
            .cache
            .entries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn size(&self) -> Result<usize, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        Ok(self.cache.entries().len())
    }
}

struct MemoryAdmin {
    cluster: Arc<Cluster>,
    reachable: Arc<AtomicBool>,
}

#[async_trait]
impl CacheAdmin for MemoryAdmin {
    async fn create_cache(
        &self,
        name: &str,
        template: Option<&str>,
        flag: AdminFlag,
    ) -> Result<(), CacheClientError> {
        ensure_reachable(&self.reachable)?;
        lock(&self.cluster.admin_calls).push(AdminCall {
            name: name.to_string(),
            template: template.map(str::to_string),
            flag,
        });

        if lock(&self.cluster.failing_creates).contains(&flag) {
            return Err(CacheClientError::Operation(format!(
                "{:?} create of '{}' rejected by server",
                flag, name
            )));
        }

        let mut caches = self.cluster.caches.write().unwrap_or_else(PoisonError::into_inner);
        match caches.get(name) {
            Some(existing) => {
                let mut existing_flag = lock(&existing.flag);
                // A permanent create makes a volatile cache survive restarts
                if flag == AdminFlag::Permanent && *existing_flag == AdminFlag::Volatile {
                    *existing_flag = AdminFlag::Permanent;
                    Ok(())
                } else {
                    Err(CacheClientError::CacheExists(name.to_string()))
                }
            }
            None => {
                caches.insert(name.to_string(), Arc::new(MemoryCache::new(name, flag)));
                tracing::debug!("Created {:?} cache '{}' (template: {:?})", flag, name, template);
                Ok(())
            }
        }
    }
}

struct MemoryScripts {
    cluster: Arc<Cluster>,
    reachable: Arc<AtomicBool>,
}

#[async_trait]
impl ScriptExecutor for MemoryScripts {
    async fn execute(
        &self,
        name: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Value, CacheClientError> {
        ensure_reachable(&self.reachable)?;
        let task = self
            .cluster
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| CacheClientError::ScriptNotFound(name.to_string()))?;
        task(params)
    }
}

fn ensure_reachable(reachable: &AtomicBool) -> Result<(), CacheClientError> {
    if reachable.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(CacheClientError::Unavailable("cluster unreachable".to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
