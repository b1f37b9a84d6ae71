//! The Tool Registry: the external mapping from prefixed tool name to
//! [`ToolProxy`] that an agent consults to discover and invoke tools.
//!
//! The trait is the contract; [`InMemoryToolRegistry`] is the one concrete
//! implementation this crate ships, so the supervisor is usable standalone
//! without an embedding application supplying its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, SupervisorError};
use crate::proxy::ToolProxy;

/// Storage for published [`ToolProxy`] values, keyed by prefixed name.
///
/// Implementations must reject duplicate registrations and treat
/// unregistering a missing name as a no-op, matching the teacher's
/// tolerant-removal convention for bookkeeping maps.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn register(&self, proxy: Arc<ToolProxy>) -> Result<()>;
    async fn unregister(&self, prefixed_name: &str);
    /// Remove every proxy belonging to `server_name`. Used by `removeServer`
    /// and `reloadServer` so a server's whole tool set can be dropped in
    /// one call without the caller needing to enumerate prefixed names.
    async fn unregister_server(&self, server_name: &str);
    async fn get(&self, prefixed_name: &str) -> Option<Arc<ToolProxy>>;
    async fn tool_names(&self) -> Vec<String>;
    async fn tool_names_for_server(&self, server_name: &str) -> Vec<String>;
    /// Every currently-registered proxy, belonging to any server. Used by
    /// `Supervisor::stats` to aggregate per-tool counters without the
    /// caller needing to enumerate names first.
    async fn all(&self) -> Vec<Arc<ToolProxy>>;
    async fn len(&self) -> usize;
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Default in-process registry, a `Mutex`-guarded `HashMap`.
///
/// The supervisor is the sole writer for the keys belonging to servers it
/// owns; the mutex exists to make concurrent reads from agent-side lookups
/// safe, not to arbitrate between multiple supervisors.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    proxies: Mutex<HashMap<String, Arc<ToolProxy>>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    async fn register(&self, proxy: Arc<ToolProxy>) -> Result<()> {
        let mut proxies = self.proxies.lock().unwrap();
        if proxies.contains_key(&proxy.prefixed_name) {
            return Err(SupervisorError::Duplicate(proxy.prefixed_name.clone()));
        }
        proxies.insert(proxy.prefixed_name.clone(), proxy);
        Ok(())
    }

    async fn unregister(&self, prefixed_name: &str) {
        self.proxies.lock().unwrap().remove(prefixed_name);
    }

    async fn unregister_server(&self, server_name: &str) {
        self.proxies
            .lock()
            .unwrap()
            .retain(|_, proxy| proxy.server_name != server_name);
    }

    async fn get(&self, prefixed_name: &str) -> Option<Arc<ToolProxy>> {
        self.proxies.lock().unwrap().get(prefixed_name).cloned()
    }

    async fn tool_names(&self) -> Vec<String> {
        self.proxies.lock().unwrap().keys().cloned().collect()
    }

    async fn tool_names_for_server(&self, server_name: &str) -> Vec<String> {
        self.proxies
            .lock()
            .unwrap()
            .values()
            .filter(|proxy| proxy.server_name == server_name)
            .map(|proxy| proxy.prefixed_name.clone())
            .collect()
    }

    async fn all(&self) -> Vec<Arc<ToolProxy>> {
        self.proxies.lock().unwrap().values().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }
}
