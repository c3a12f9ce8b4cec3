//! Memory Pool Adapter: a slab-like, no-eviction arena over device or host
//! memory. Addresses handed out are opaque offsets into a fixed-size byte
//! arena standing in for accelerator/host memory, since real device
//! addresses are not observable from this crate.

use parking_lot::Mutex;

use crate::error::{EngineError, Result, StatusCode};
use crate::types::Placement;

#[derive(Debug)]
struct FreeListPool {
    capacity: u64,
    used: u64,
    free_list: Vec<(u64, u64)>,
    next_offset: u64,
}

impl FreeListPool {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: 0,
            free_list: Vec::new(),
            next_offset: 1, // offset 0 is reserved so addresses are always non-zero
        }
    }

    fn allocate(&mut self, size: u64) -> Option<u64> {
        if let Some(pos) = self.free_list.iter().position(|&(_, s)| s >= size) {
            let (addr, slot_size) = self.free_list.remove(pos);
            if slot_size > size {
                self.free_list.push((addr + size, slot_size - size));
            }
            self.used += size;
            return Some(addr);
        }
        if self.next_offset.checked_add(size)? > self.capacity.max(1) + 1 {
            return None;
        }
        let addr = self.next_offset;
        self.next_offset += size;
        self.used += size;
        Some(addr)
    }

    fn deallocate(&mut self, addr: u64, size: u64) {
        self.free_list.push((addr, size));
        self.used = self.used.saturating_sub(size);
    }

    fn available_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// A single device- or host-memory arena. Construction with `capacity == 0`
/// means the pool is not configured (`enable_cache_manager`-gated ops that
/// target this placement are rejected with `FeatureNotEnabled`).
#[derive(Debug)]
pub struct MemoryPool {
    placement: Placement,
    inner: Option<Mutex<FreeListPool>>,
}

impl MemoryPool {
    pub fn configured(placement: Placement, capacity: u64) -> Self {
        Self {
            placement,
            inner: Some(Mutex::new(FreeListPool::new(capacity))),
        }
    }

    pub fn unconfigured(placement: Placement) -> Self {
        Self {
            placement,
            inner: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    fn out_of_memory_status(&self) -> StatusCode {
        match self.placement {
            Placement::Device => StatusCode::DeviceOutOfMemory,
            Placement::Host => StatusCode::OutOfMemory,
        }
    }

    pub fn allocate(&self, size: u64) -> Result<u64> {
        let inner = self.inner.as_ref().ok_or_else(|| {
            EngineError::new(
                StatusCode::FeatureNotEnabled,
                format!("no memory pool configured for {:?}", self.placement),
            )
        })?;
        let mut pool = inner.lock();
        pool.allocate(size)
            .ok_or_else(|| EngineError::new(self.out_of_memory_status(), "memory pool exhausted"))
    }

    pub fn deallocate(&self, addr: u64, size: u64) {
        if let Some(inner) = &self.inner {
            inner.lock().deallocate(addr, size);
        }
    }

    pub fn available_bytes(&self) -> u64 {
        self.inner.as_ref().map(|p| p.lock().available_bytes()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_pool_rejects_allocation() {
        let pool = MemoryPool::unconfigured(Placement::Device);
        let err = pool.allocate(64).unwrap_err();
        assert_eq!(err.status(), StatusCode::FeatureNotEnabled);
    }

    #[test]
    fn allocate_and_reuse_freed_slot() {
        let pool = MemoryPool::configured(Placement::Host, 1024);
        let a = pool.allocate(128).unwrap();
        assert_ne!(a, 0);
        pool.deallocate(a, 128);
        let b = pool.allocate(128).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhausted_pool_reports_out_of_memory() {
        let pool = MemoryPool::configured(Placement::Device, 64);
        pool.allocate(64).unwrap();
        let err = pool.allocate(1).unwrap_err();
        assert_eq!(err.status(), StatusCode::DeviceOutOfMemory);
    }
}
