//! Public API Façade: the single entry point (`Engine`) tying together the
//! cache registry, memory pools, peer link manager and transfer engine, and
//! enforcing the mode gates and role-lifecycle rules described in
//! SPEC_FULL.md §4.7-4.8.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

use crate::config::{EngineOptions, Role};
use crate::error::{EngineError, Result, StatusCode};
use crate::link::{ClusterEndpoint, PeerLinkManager};
use crate::pool::MemoryPool;
use crate::registry::CacheRegistry;
use crate::transfer::{LoopbackTransport, TransferEngine};
use crate::types::Placement;

static LIVE_ENGINES: Lazy<Mutex<Vec<std::sync::Weak<EngineInner>>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn live_engines() -> &'static Mutex<Vec<std::sync::Weak<EngineInner>>> {
    &LIVE_ENGINES
}

/// Finalizes every engine still registered as live. Intended to be called
/// once from the binary's shutdown path, mirroring an `atexit` hook.
pub fn shutdown_all() {
    let engines = live_engines().lock();
    for weak in engines.iter() {
        if let Some(inner) = weak.upgrade() {
            inner.finalize_inner();
        }
    }
}

struct EngineInner {
    role: Mutex<Role>,
    options: Mutex<EngineOptions>,
    initialized: AtomicBool,
    registry: OnceCell<Arc<CacheRegistry>>,
    links: PeerLinkManager,
    transfer: OnceCell<TransferEngine>,
}

impl EngineInner {
    fn registry(&self) -> Option<&Arc<CacheRegistry>> {
        self.registry.get()
    }

    fn transfer(&self) -> Option<&TransferEngine> {
        self.transfer.get()
    }
}

impl EngineInner {
    fn finalize_inner(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("engine finalized");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.finalize_inner();
    }
}

/// The top-level CacheManager + DataDist coordination handle. Construction
/// does not call `init`; a handle may be built once and initialized, reset,
/// and finalized, matching the source's one-shot-per-process singleton rule
/// at the process level (at most one live `Engine` with `init` called).
pub struct Engine {
    inner: Arc<EngineInner>,
}

static ENGINE_LIVE: AtomicBool = AtomicBool::new(false);

impl Engine {
    pub fn new() -> Self {
        let inner = Arc::new(EngineInner {
            role: Mutex::new(Role::Prompt),
            options: Mutex::new(EngineOptions::default()),
            initialized: AtomicBool::new(false),
            registry: OnceCell::new(),
            links: PeerLinkManager::new(),
            transfer: OnceCell::new(),
        });
        Self { inner }
    }

    /// One-shot per process: a second call on an already-initialized façade
    /// is a no-op; initializing a second façade while one is live fails.
    pub fn init(&self, role: Role, options: HashMap<String, String>) -> Result<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if ENGINE_LIVE.swap(true, Ordering::AcqRel) {
            return Err(EngineError::new(StatusCode::Failed, "cannot init multiple engines in one process"));
        }

        let parsed = EngineOptions::from_map(&options)?;
        let device_bytes = parsed.device_mem_pool_bytes.unwrap_or(0);
        let host_bytes = parsed.host_mem_pool_bytes.unwrap_or(0);

        let registry = Arc::new(CacheRegistry::new(
            Arc::new(if device_bytes > 0 {
                MemoryPool::configured(Placement::Device, device_bytes)
            } else {
                MemoryPool::unconfigured(Placement::Device)
            }),
            Arc::new(if host_bytes > 0 {
                MemoryPool::configured(Placement::Host, host_bytes)
            } else {
                MemoryPool::unconfigured(Placement::Host)
            }),
        ));

        let transfer = TransferEngine::new(registry.clone(), Arc::new(LoopbackTransport));
        let _ = self.inner.registry.set(registry);
        let _ = self.inner.transfer.set(transfer);
        *self.inner.role.lock() = role;
        *self.inner.options.lock() = parsed;
        self.inner.initialized.store(true, Ordering::Release);
        live_engines().lock().push(Arc::downgrade(&self.inner));
        tracing::info!(?role, "engine initialized");
        Ok(())
    }

    fn require_initialized(&self) -> Result<()> {
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Err(EngineError::new(StatusCode::EngineFinalized, "engine not initialized"));
        }
        Ok(())
    }

    fn require_cache_manager(&self) -> Result<()> {
        self.require_initialized()?;
        if !self.inner.options.lock().enable_cache_manager {
            return Err(EngineError::new(StatusCode::FeatureNotEnabled, "cache manager not enabled"));
        }
        Ok(())
    }

    fn require_remote_accessible(&self) -> Result<()> {
        if !self.inner.options.lock().enable_remote_cache_accessible {
            return Err(EngineError::new(
                StatusCode::FeatureNotEnabled,
                "remote cache accessible not enabled",
            ));
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<Arc<CacheRegistry>> {
        self.require_cache_manager()?;
        Ok(self
            .inner
            .registry()
            .expect("registry initialized alongside enable_cache_manager")
            .clone())
    }

    pub fn transfer(&self) -> Result<&TransferEngine> {
        self.require_cache_manager()?;
        Ok(self
            .inner
            .transfer()
            .expect("transfer engine initialized alongside enable_cache_manager"))
    }

    pub fn push_enabled(&self) -> Result<()> {
        self.require_remote_accessible()
    }

    pub fn role(&self) -> Role {
        *self.inner.role.lock()
    }

    pub fn link(
        &self,
        comm_name: &str,
        cluster_rank_info: &HashMap<u64, u64>,
        rank_table: &str,
    ) -> Result<u64> {
        self.require_initialized()?;
        let comm_id = self.inner.links.link(comm_name, cluster_rank_info, rank_table)?;
        if let Some(registry) = self.inner.registry() {
            registry.set_is_call_linked();
        }
        Ok(comm_id)
    }

    pub fn unlink(&self, comm_id: u64) -> Result<()> {
        self.require_initialized()?;
        self.inner.links.unlink(comm_id)
    }

    pub fn link_clusters(&self, clusters: &[ClusterEndpoint], timeout_ms: u64) -> Result<(StatusCode, Vec<StatusCode>)> {
        self.require_initialized()?;
        let requires_local = self.inner.options.lock().local_comm_res.is_none();
        let result = self.inner.links.link_clusters(clusters, timeout_ms, requires_local)?;
        if let Some(registry) = self.inner.registry() {
            registry.set_is_call_linked();
        }
        Ok(result)
    }

    pub fn unlink_clusters(&self, cluster_ids: &[u64], timeout_ms: u64, force: bool) -> Result<(StatusCode, Vec<StatusCode>)> {
        self.require_initialized()?;
        self.inner.links.unlink_clusters(cluster_ids, timeout_ms, force)
    }

    pub fn query_register_mem_status(&self, comm_id: u64) -> Result<crate::types::RegisterMemStatus> {
        self.inner.links.query_register_mem_status(comm_id)
    }

    /// Switches the engine's role, closing/opening the listener as needed.
    /// `Decoder -> Prompt` requires `listen_ip_info` unless a local comm
    /// resource blob already implies topology (SPEC_FULL.md §4.7).
    pub fn switch_role(&self, new_role: Role, listen_ip_info: Option<&str>) -> Result<()> {
        self.require_initialized()?;
        let cache_mgr_mode = self.inner.options.lock().enable_cache_manager;
        let mut role = self.inner.role.lock();
        if !cache_mgr_mode {
            if !self.inner.options.lock().enable_switch_role {
                return Err(EngineError::new(StatusCode::FeatureNotEnabled, "switch_role not enabled"));
            }
            if *role == new_role {
                return Err(EngineError::param_invalid("role not changed"));
            }
            if *role == Role::Decoder && new_role == Role::Prompt {
                let has_topology = self.inner.options.lock().local_comm_res.is_some();
                if listen_ip_info.is_none() && !has_topology {
                    return Err(EngineError::param_invalid(
                        "listen_ip_info is required when switching Decoder -> Prompt",
                    ));
                }
            }
        }
        *role = new_role;
        tracing::info!(?new_role, "role switched");
        Ok(())
    }

    /// Idempotent: a second call returns success without side effects.
    pub fn finalize(&self) -> Result<()> {
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.finalize_inner();
        ENGINE_LIVE.store(false, Ordering::Release);
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_noop() {
        let engine = Engine::new();
        engine.init(Role::Prompt, HashMap::new()).unwrap();
        engine.init(Role::Decoder, HashMap::new()).unwrap();
        assert_eq!(engine.role(), Role::Prompt);
        engine.finalize().unwrap();
    }

    #[test]
    fn finalize_is_idempotent() {
        let engine = Engine::new();
        engine.init(Role::Prompt, HashMap::new()).unwrap();
        engine.finalize().unwrap();
        engine.finalize().unwrap();
    }

    #[test]
    fn cache_ops_require_enable_cache_manager() {
        let engine = Engine::new();
        engine.init(Role::Prompt, HashMap::new()).unwrap();
        let err = engine.registry().unwrap_err();
        assert_eq!(err.status(), StatusCode::FeatureNotEnabled);
        engine.finalize().unwrap();
    }
}
