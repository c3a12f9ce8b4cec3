//! Cache Registry: the process-local table of `Cache` entities, indexed by
//! `cache_id` plus the `CacheKey`/`BlocksCacheKey` that address them remotely.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{EngineError, Result, StatusCode};
use crate::pool::MemoryPool;
use crate::types::{BlocksCacheKey, CacheDesc, CacheKey, MemInfo, Memtype, Placement};

/// A registered or pool-allocated set of tensors. Handles are `cache_id`
/// only; the `Cache` itself lives exclusively in the registry.
#[derive(Debug)]
pub struct Cache {
    pub cache_id: i64,
    pub desc: CacheDesc,
    pub tensor_addrs: Vec<u64>,
    pub is_registered: bool,
    pub remote_accessible: bool,
    pub valid: bool,
}

impl Cache {
    pub fn is_blocks_cache(&self) -> bool {
        self.desc.is_blocks
    }
}

#[derive(Debug)]
pub struct CacheRegistry {
    next_id: AtomicI64,
    caches: DashMap<i64, Cache>,
    keys: DashMap<CacheKey, i64>,
    blocks_keys: DashMap<BlocksCacheKey, i64>,
    device_pool: Arc<MemoryPool>,
    host_pool: Arc<MemoryPool>,
    is_call_linked: std::sync::atomic::AtomicBool,
}

impl CacheRegistry {
    pub fn new(device_pool: Arc<MemoryPool>, host_pool: Arc<MemoryPool>) -> Self {
        Self {
            next_id: AtomicI64::new(0),
            caches: DashMap::new(),
            keys: DashMap::new(),
            blocks_keys: DashMap::new(),
            device_pool,
            host_pool,
            is_call_linked: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_is_call_linked(&self) {
        self.is_call_linked.store(true, Ordering::Relaxed);
    }

    pub fn is_call_linked(&self) -> bool {
        self.is_call_linked.load(Ordering::Relaxed)
    }

    fn pool_for(&self, placement: Placement) -> &Arc<MemoryPool> {
        match placement {
            Placement::Device => &self.device_pool,
            Placement::Host => &self.host_pool,
        }
    }

    fn default_remote_accessible(&self, placement: Placement) -> bool {
        if self.is_call_linked() {
            false
        } else {
            matches!(placement, Placement::Device)
        }
    }

    fn insert_cache(&self, desc: CacheDesc, tensor_addrs: Vec<u64>, is_registered: bool, remote_accessible: bool) -> i64 {
        let cache_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.caches.insert(
            cache_id,
            Cache {
                cache_id,
                desc,
                tensor_addrs,
                is_registered,
                remote_accessible,
                valid: true,
            },
        );
        cache_id
    }

    pub fn allocate_cache(&self, desc: CacheDesc, keys: &[CacheKey]) -> Result<i64> {
        if desc.num_tensors == 0 {
            return Err(EngineError::param_invalid("num_tensors must be >= 1"));
        }
        let pool = self.pool_for(desc.placement);
        let size = desc.size()? as u64;
        let mut addrs = Vec::with_capacity(desc.num_tensors as usize);
        for _ in 0..desc.num_tensors {
            addrs.push(pool.allocate(size)?);
        }
        let remote_accessible = self.default_remote_accessible(desc.placement);
        let cache_id = self.insert_cache(desc, addrs, false, remote_accessible);
        self.bind_keys(cache_id, keys)?;
        Ok(cache_id)
    }

    pub fn allocate_blocks_cache(&self, mut desc: CacheDesc, blocks_key: Option<BlocksCacheKey>) -> Result<i64> {
        desc.is_blocks = true;
        let pool = self.pool_for(desc.placement);
        let size = desc.size()? as u64;
        let mut addrs = Vec::with_capacity(desc.num_tensors as usize);
        for _ in 0..desc.num_tensors {
            addrs.push(pool.allocate(size)?);
        }
        let remote_accessible = self.default_remote_accessible(desc.placement);
        let cache_id = self.insert_cache(desc, addrs, false, remote_accessible);
        if let Some(key) = blocks_key {
            if self.blocks_keys.contains_key(&key) {
                return Err(EngineError::new(StatusCode::RepeatRequest, "blocks cache key already bound"));
            }
            self.blocks_keys.insert(key, cache_id);
        }
        Ok(cache_id)
    }

    pub fn register_cache(
        &self,
        desc: CacheDesc,
        addrs: Vec<u64>,
        keys: &[CacheKey],
        remote_accessible: Option<bool>,
    ) -> Result<i64> {
        if addrs.len() != desc.num_tensors as usize {
            return Err(EngineError::param_invalid("addrs length must equal num_tensors"));
        }
        if addrs.contains(&0) {
            return Err(EngineError::param_invalid("registered addresses must be non-zero"));
        }
        let remote_accessible = remote_accessible.unwrap_or_else(|| self.default_remote_accessible(desc.placement));
        if remote_accessible && self.is_call_linked() {
            return Err(EngineError::new(
                StatusCode::FeatureNotEnabled,
                "cannot register a remote-accessible cache after a link is established",
            ));
        }
        let cache_id = self.insert_cache(desc, addrs, true, remote_accessible);
        self.bind_keys(cache_id, keys)?;
        Ok(cache_id)
    }

    pub fn register_blocks_cache(
        &self,
        mut desc: CacheDesc,
        addrs: Vec<u64>,
        blocks_key: Option<BlocksCacheKey>,
        remote_accessible: Option<bool>,
    ) -> Result<i64> {
        desc.is_blocks = true;
        if addrs.len() != desc.num_tensors as usize {
            return Err(EngineError::param_invalid("addrs length must equal num_tensors"));
        }
        let remote_accessible = remote_accessible.unwrap_or_else(|| self.default_remote_accessible(desc.placement));
        if remote_accessible && self.is_call_linked() {
            return Err(EngineError::new(
                StatusCode::FeatureNotEnabled,
                "cannot register a remote-accessible cache after a link is established",
            ));
        }
        let cache_id = self.insert_cache(desc, addrs, true, remote_accessible);
        if let Some(key) = blocks_key {
            if self.blocks_keys.contains_key(&key) {
                return Err(EngineError::new(StatusCode::RepeatRequest, "blocks cache key already bound"));
            }
            self.blocks_keys.insert(key, cache_id);
        }
        Ok(cache_id)
    }

    fn bind_keys(&self, cache_id: i64, keys: &[CacheKey]) -> Result<()> {
        for key in keys {
            if self.keys.contains_key(key) {
                return Err(EngineError::new(StatusCode::RepeatRequest, "cache key already bound"));
            }
            self.keys.insert(*key, cache_id);
        }
        Ok(())
    }

    pub fn resolve_key(&self, key: &CacheKey) -> Result<i64> {
        self.keys
            .get(key)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::new(StatusCode::KvCacheNotExist, "cache key not registered"))
    }

    pub fn resolve_blocks_key(&self, key: &BlocksCacheKey) -> Result<i64> {
        self.blocks_keys
            .get(key)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::new(StatusCode::KvCacheNotExist, "blocks cache key not registered"))
    }

    pub fn get(&self, cache_id: i64) -> Result<dashmap::mapref::one::Ref<'_, i64, Cache>> {
        let entry = self
            .caches
            .get(&cache_id)
            .ok_or_else(|| EngineError::new(StatusCode::KvCacheNotExist, "cache id not found"))?;
        if !entry.valid {
            return Err(EngineError::new(StatusCode::KvCacheNotExist, "cache already deallocated"));
        }
        Ok(entry)
    }

    /// Consumes the key-to-cache binding after a successful pull, per §3's
    /// weak-reference-count rule.
    pub fn consume_key(&self, key: &CacheKey) {
        self.keys.remove(key);
    }

    pub fn remove_cache_key(&self, key: &CacheKey) -> StatusCode {
        // Always a no-op success, including for unknown/already-consumed keys
        // (see SPEC_FULL.md Open Question decisions).
        self.keys.remove(key);
        StatusCode::Success
    }

    pub fn deallocate_cache(&self, cache_id: i64) -> Result<()> {
        let mut entry = self
            .caches
            .get_mut(&cache_id)
            .ok_or_else(|| EngineError::new(StatusCode::KvCacheNotExist, "cache id not found"))?;
        if !entry.valid {
            return Err(EngineError::new(StatusCode::KvCacheNotExist, "cache already deallocated"));
        }
        if entry.is_registered {
            return Err(EngineError::param_invalid("cannot deallocate an externally-registered cache"));
        }
        let size = entry.desc.size()? as u64;
        let pool = self.pool_for(entry.desc.placement);
        for addr in entry.tensor_addrs.drain(..) {
            pool.deallocate(addr, size);
        }
        entry.valid = false;
        Ok(())
    }

    pub fn unregister_cache(&self, cache_id: i64) -> Result<()> {
        let mut entry = self
            .caches
            .get_mut(&cache_id)
            .ok_or_else(|| EngineError::new(StatusCode::KvCacheNotExist, "cache id not found"))?;
        if !entry.valid {
            return Err(EngineError::new(StatusCode::KvCacheNotExist, "cache already unregistered"));
        }
        entry.valid = false;
        entry.tensor_addrs.clear();
        Ok(())
    }

    /// Rebinds the physical backing for a previously-registered device cache
    /// after a fault. Only device-placement caches may be remapped, and every
    /// supplied `MemInfo` must itself be device memory with a non-zero
    /// address and size.
    pub fn remap_registered_memory(&self, updates: &[(i64, Vec<MemInfo>)]) -> Result<()> {
        for (cache_id, new_mem) in updates {
            let mut entry = self
                .caches
                .get_mut(cache_id)
                .ok_or_else(|| EngineError::new(StatusCode::KvCacheNotExist, "cache id not found"))?;
            if entry.desc.placement != Placement::Device {
                return Err(EngineError::param_invalid("remap_registered_memory requires a device-placement cache"));
            }
            if new_mem.len() != entry.tensor_addrs.len() {
                return Err(EngineError::param_invalid("remap address count must match existing tensor count"));
            }
            for info in new_mem {
                if info.mem_type != Memtype::Device {
                    return Err(EngineError::param_invalid("remap MemInfo.mem_type must be Device"));
                }
                if info.addr == 0 {
                    return Err(EngineError::param_invalid("remap MemInfo.addr must be non-zero"));
                }
                if info.size == 0 {
                    return Err(EngineError::param_invalid("remap MemInfo.size must be > 0"));
                }
            }
            entry.tensor_addrs = new_mem.iter().map(|m| m.addr).collect();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn registry() -> CacheRegistry {
        CacheRegistry::new(
            Arc::new(MemoryPool::configured(Placement::Device, 1 << 20)),
            Arc::new(MemoryPool::configured(Placement::Host, 1 << 20)),
        )
    }

    #[test]
    fn allocate_then_deallocate_frees_memory() {
        let reg = registry();
        let desc = CacheDesc::new(2, vec![4, 4], DataType::Float16, Placement::Device).unwrap();
        let key = CacheKey::new(1, 42, 0, crate::types::INVALID_ID).unwrap();
        let id = reg.allocate_cache(desc, &[key]).unwrap();
        assert!(reg.get(id).is_ok());
        reg.deallocate_cache(id).unwrap();
        assert!(reg.get(id).is_err());
    }

    #[test]
    fn duplicate_key_binding_rejected() {
        let reg = registry();
        let desc = CacheDesc::new(2, vec![4, 4], DataType::Float16, Placement::Device).unwrap();
        let desc2 = CacheDesc::new(2, vec![4, 4], DataType::Float16, Placement::Device).unwrap();
        let key = CacheKey::new(1, 42, 0, crate::types::INVALID_ID).unwrap();
        reg.allocate_cache(desc, &[key]).unwrap();
        let err = reg.allocate_cache(desc2, &[key]).unwrap_err();
        assert_eq!(err.status(), StatusCode::RepeatRequest);
    }

    #[test]
    fn remove_cache_key_is_idempotent_noop() {
        let reg = registry();
        let key = CacheKey::new(1, 7, 0, crate::types::INVALID_ID).unwrap();
        assert_eq!(reg.remove_cache_key(&key), StatusCode::Success);
        assert_eq!(reg.remove_cache_key(&key), StatusCode::Success);
    }

    #[test]
    fn remap_registered_memory_rejects_zero_address() {
        let reg = registry();
        let desc = CacheDesc::new(2, vec![4, 4], DataType::Float16, Placement::Device).unwrap();
        let id = reg.allocate_cache(desc, &[]).unwrap();
        let bad = vec![
            crate::types::MemInfo {
                mem_type: crate::types::Memtype::Device,
                addr: 0,
                size: 64,
            },
            crate::types::MemInfo::new(crate::types::Memtype::Device, 200, 64).unwrap(),
        ];
        let err = reg.remap_registered_memory(&[(id, bad)]).unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
    }

    #[test]
    fn remap_registered_memory_updates_addresses() {
        let reg = registry();
        let desc = CacheDesc::new(2, vec![4, 4], DataType::Float16, Placement::Device).unwrap();
        let id = reg.allocate_cache(desc, &[]).unwrap();
        let good = vec![
            crate::types::MemInfo::new(crate::types::Memtype::Device, 100, 64).unwrap(),
            crate::types::MemInfo::new(crate::types::Memtype::Device, 200, 64).unwrap(),
        ];
        reg.remap_registered_memory(&[(id, good)]).unwrap();
        assert_eq!(reg.get(id).unwrap().tensor_addrs, vec![100, 200]);
    }
}
