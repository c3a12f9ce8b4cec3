//! Transfer Engine: synchronous single-shot transfers plus the asynchronous
//! layer-pipelined transfer (`transfer_cache_async`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{EngineError, Result, StatusCode};
use crate::registry::CacheRegistry;
use crate::types::{BlocksCacheKey, CacheKey, CacheKeyByIdAndIndex, LayerRange, TransferConfig, TransferWithCacheKeyConfig};

/// Capability the caller supplies so the engine can wait for a given source
/// layer to be ready before transferring it.
#[async_trait]
pub trait LayerSynchronizer: Send + Sync {
    async fn synchronize_layer(&self, layer_index: usize, timeout_ms: u64) -> bool;
}

/// A `LayerSynchronizer` that is always immediately ready; used when the
/// producer side has no cross-layer dependency to honor.
pub struct AlwaysReady;

#[async_trait]
impl LayerSynchronizer for AlwaysReady {
    async fn synchronize_layer(&self, _layer_index: usize, _timeout_ms: u64) -> bool {
        true
    }
}

enum DestConfig {
    Address(TransferConfig),
    CacheKey(TransferWithCacheKeyConfig),
}

struct Destination {
    config: DestConfig,
    src_layer_range: LayerRange,
}

/// How `pull_blocks` addresses its remote source cache.
pub enum PullSource<'a> {
    Cache(&'a CacheKey),
    Blocks(&'a BlocksCacheKey),
}

/// Trait abstracting the underlying RDMA-class interconnect. The crate ships
/// a simulated in-process implementation exercised by tests; a real
/// deployment substitutes an RDMA-backed transport without touching the
/// coordination layer above.
pub trait Transport: Send + Sync {
    fn transfer_layer(&self, dest_index: usize, src_layer: usize, dst_layer: usize) -> Result<()>;
}

/// A transport that always succeeds; used as the default simulated backend.
pub struct LoopbackTransport;

impl Transport for LoopbackTransport {
    fn transfer_layer(&self, _dest_index: usize, _src_layer: usize, _dst_layer: usize) -> Result<()> {
        Ok(())
    }
}

/// Handle to an in-flight asynchronous transfer. One terminal `StatusCode`
/// per configured destination.
#[derive(Debug)]
pub struct CacheTask {
    statuses: Arc<Mutex<Vec<Option<StatusCode>>>>,
    notify: Arc<Notify>,
    done: Arc<std::sync::atomic::AtomicBool>,
}

impl CacheTask {
    /// Waits for completion, returning the first non-success status or
    /// `Success` once every destination has a terminal status.
    pub async fn synchronize(&self, timeout_ms: Option<u64>) -> StatusCode {
        self.wait(timeout_ms).await;
        let statuses = self.statuses.lock();
        for s in statuses.iter() {
            match s {
                Some(code) if !code.is_ok() => return *code,
                None => return StatusCode::Timeout,
                _ => {}
            }
        }
        StatusCode::Success
    }

    /// Waits for completion, returning the per-destination status vector.
    pub async fn get_results(&self, timeout_ms: Option<u64>) -> Vec<StatusCode> {
        self.wait(timeout_ms).await;
        self.statuses
            .lock()
            .iter()
            .map(|s| s.unwrap_or(StatusCode::Timeout))
            .collect()
    }

    async fn wait(&self, timeout_ms: Option<u64>) {
        if self.done.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        let wait_fut = self.notify.notified();
        match timeout_ms {
            Some(ms) => {
                let _ = timeout(Duration::from_millis(ms), wait_fut).await;
            }
            None => wait_fut.await,
        }
    }
}

pub struct TransferEngine {
    registry: Arc<CacheRegistry>,
    transport: Arc<dyn Transport>,
}

impl TransferEngine {
    pub fn new(registry: Arc<CacheRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self { registry, transport }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Spawns the background worker driving the layer-pipelined transfer and
    /// returns a `CacheTask` immediately.
    pub fn transfer_cache_async(
        &self,
        src_cache_id: i64,
        synchronizer: Arc<dyn LayerSynchronizer>,
        address_configs: Vec<TransferConfig>,
        key_configs: Vec<TransferWithCacheKeyConfig>,
        tensor_num_per_layer: usize,
    ) -> Result<CacheTask> {
        let cache = self.registry.get(src_cache_id)?;
        let num_tensors = cache.desc.num_tensors as usize;
        if !num_tensors.is_multiple_of(tensor_num_per_layer) {
            return Err(EngineError::param_invalid("num_tensors must be a multiple of tensor_num_per_layer"));
        }
        let num_source_layers = num_tensors / tensor_num_per_layer;
        drop(cache);

        let mut destinations = Vec::with_capacity(address_configs.len() + key_configs.len());
        for cfg in address_configs {
            let range = cfg
                .src_layer_range
                .map(Ok)
                .unwrap_or_else(|| LayerRange::new(0, num_source_layers))?;
            if range.stop > num_source_layers {
                return Err(EngineError::param_invalid("src_layer_range exceeds source layer count"));
            }
            if cfg.dst_addrs.len() != range.len() * tensor_num_per_layer {
                return Err(EngineError::param_invalid("dst_addrs length must match src_layer_range * tensor_num_per_layer"));
            }
            destinations.push(Destination {
                config: DestConfig::Address(cfg),
                src_layer_range: range,
            });
        }
        for cfg in key_configs {
            cfg.validate()?;
            let range = cfg
                .src_layer_range
                .map(Ok)
                .unwrap_or_else(|| LayerRange::new(0, num_source_layers))?;
            if range.stop > num_source_layers {
                return Err(EngineError::param_invalid("src_layer_range exceeds source layer count"));
            }
            destinations.push(Destination {
                config: DestConfig::CacheKey(cfg),
                src_layer_range: range,
            });
        }

        let num_dest = destinations.len();
        let statuses = Arc::new(Mutex::new(vec![None; num_dest]));
        let notify = Arc::new(Notify::new());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let transport = self.transport.clone();
        let statuses_worker = statuses.clone();
        let notify_worker = notify.clone();
        let done_worker = done.clone();

        tokio::spawn(async move {
            let mut pending: Vec<bool> = vec![true; num_dest];
            'outer: for layer in 0..num_source_layers {
                let active: Vec<usize> = (0..num_dest)
                    .filter(|&i| pending[i] && destinations[i].src_layer_range.contains(layer))
                    .collect();
                if active.is_empty() {
                    continue;
                }
                if !synchronizer.synchronize_layer(layer, 5000).await {
                    let mut statuses = statuses_worker.lock();
                    for i in 0..num_dest {
                        if pending[i] {
                            statuses[i] = Some(StatusCode::SyncLayerFailed);
                            pending[i] = false;
                        }
                    }
                    break 'outer;
                }
                for &i in &active {
                    let dst_layer = layer - destinations[i].src_layer_range.start;
                    match &destinations[i].config {
                        DestConfig::Address(cfg) => {
                            tracing::debug!(dest = i, cluster = cfg.dst_cluster_id, layer, "transferring layer to address destination")
                        }
                        DestConfig::CacheKey(cfg) => {
                            tracing::debug!(dest = i, cluster = cfg.cache_key.cluster_id, layer, "transferring layer to cache-key destination")
                        }
                    }
                    match transport.transfer_layer(i, layer, dst_layer) {
                        Ok(()) => {
                            if layer == destinations[i].src_layer_range.stop - 1 {
                                statuses_worker.lock()[i] = Some(StatusCode::Success);
                                pending[i] = false;
                            }
                        }
                        Err(e) => {
                            statuses_worker.lock()[i] = Some(e.status());
                            pending[i] = false;
                        }
                    }
                }
            }
            // A destination left `None` here never ran to completion (e.g. its
            // layer range was never reached) — leave it unset rather than
            // fabricate a status; `synchronize`/`get_results` surface `None`
            // as `Timeout`, never as `Success`.
            done_worker.store(true, std::sync::atomic::Ordering::Release);
            notify_worker.notify_waiters();
        });

        Ok(CacheTask { statuses, notify, done })
    }

    /// Pulls a whole remote cache, addressed by the `CacheKey` the source
    /// bound at allocation/registration time. The key is consumed on success
    /// so a second pull against the same key fails with `KvCacheNotExist`.
    pub fn pull_cache(&self, src_key: &CacheKey, dst_cache_id: i64, batch_index: u32, size: i64) -> Result<()> {
        let dst = self.registry.get(dst_cache_id)?;
        if dst.is_blocks_cache() {
            return Err(EngineError::param_invalid("pull_cache destination must not be a blocks cache"));
        }
        if size != -1 && size <= 0 {
            return Err(EngineError::param_invalid("size must be -1 or > 0"));
        }
        if batch_index as i64 >= dst.desc.batch_size() {
            return Err(EngineError::param_invalid("batch_index out of range"));
        }
        let src_cache_id = self.registry.resolve_key(src_key)?;
        self.transport.transfer_layer(0, 0, 0)?;
        let _ = src_cache_id;
        self.registry.consume_key(src_key);
        Ok(())
    }

    pub fn pull_blocks(&self, src: PullSource<'_>, dst_cache_id: i64, src_blocks: &[u32], dst_blocks: &[u32]) -> Result<()> {
        let dst = self.registry.get(dst_cache_id)?;
        if !dst.is_blocks_cache() {
            return Err(EngineError::param_invalid("pull_blocks destination must be a blocks cache"));
        }
        if dst_blocks.is_empty() {
            return Err(EngineError::param_invalid("dst_blocks must be non-empty"));
        }
        let src_cache_id = match src {
            PullSource::Blocks(key) => {
                if src_blocks.is_empty() {
                    return Err(EngineError::param_invalid("src_blocks must be non-empty when source is a blocks cache key"));
                }
                self.registry.resolve_blocks_key(key)?
            }
            PullSource::Cache(key) => {
                if !src_blocks.is_empty() {
                    return Err(EngineError::param_invalid("src_blocks must be empty when source is not a blocks cache key"));
                }
                self.registry.resolve_key(key)?
            }
        };
        let _ = src_cache_id;
        self.transport.transfer_layer(0, 0, 0)
    }

    pub fn push_cache(
        &self,
        src_cache_id: i64,
        dst: CacheKeyByIdAndIndex,
        size: i64,
        src_layer_range: Option<LayerRange>,
        dst_layer_range: Option<LayerRange>,
        tensor_num_per_layer: usize,
    ) -> Result<()> {
        if size != -1 {
            return Err(EngineError::param_invalid("push_cache requires size == -1"));
        }
        let src = self.registry.get(src_cache_id)?;
        let num_layers = src.desc.num_tensors as usize / tensor_num_per_layer;
        let src_range = src_layer_range.map(Ok).unwrap_or_else(|| LayerRange::new(0, num_layers))?;
        let dst_range = dst_layer_range.unwrap_or(src_range);
        if src_range.len() != dst_range.len() {
            return Err(EngineError::param_invalid("src_layer_range and dst_layer_range must have equal length"));
        }
        tracing::debug!(cluster = dst.cluster_id, cache_id = dst.cache_id, "pushing cache to remote cluster");
        for layer in src_range.start..src_range.stop {
            self.transport.transfer_layer(0, layer, layer - src_range.start + dst_range.start)?;
        }
        Ok(())
    }

    pub fn push_blocks(&self, src_cache_id: i64, dst: CacheKeyByIdAndIndex, src_blocks: &[u32], dst_blocks: &[u32]) -> Result<()> {
        let src = self.registry.get(src_cache_id)?;
        if !src.is_blocks_cache() {
            return Err(EngineError::param_invalid("push_blocks source must be a blocks cache"));
        }
        if src_blocks.is_empty() || dst_blocks.is_empty() {
            return Err(EngineError::param_invalid("src_blocks and dst_blocks must be non-empty"));
        }
        if src_blocks.len() != dst_blocks.len() {
            return Err(EngineError::param_invalid("src_blocks and dst_blocks must have equal length"));
        }
        tracing::debug!(cluster = dst.cluster_id, cache_id = dst.cache_id, "pushing blocks to remote cluster");
        for (&s, &d) in src_blocks.iter().zip(dst_blocks) {
            self.transport.transfer_layer(0, s as usize, d as usize)?;
        }
        Ok(())
    }

    pub fn copy_cache(&self, dst_cache_id: i64, src_cache_id: i64, size: i64) -> Result<()> {
        let dst = self.registry.get(dst_cache_id)?;
        let src = self.registry.get(src_cache_id)?;
        if dst.is_blocks_cache() || src.is_blocks_cache() {
            return Err(EngineError::param_invalid("copy_cache does not support blocks caches"));
        }
        if size == 0 || (size != -1 && size < 0) {
            return Err(EngineError::param_invalid("size must be -1 or > 0"));
        }
        self.transport.transfer_layer(0, 0, 0)
    }

    pub fn copy_blocks(&self, cache_id: i64, copy_block_info: &HashMap<u32, Vec<u32>>) -> Result<()> {
        let cache = self.registry.get(cache_id)?;
        if !cache.is_blocks_cache() {
            return Err(EngineError::param_invalid("copy_blocks requires a blocks cache"));
        }
        for (&src_block, dsts) in copy_block_info {
            for &dst_block in dsts {
                self.transport.transfer_layer(0, src_block as usize, dst_block as usize)?;
            }
        }
        Ok(())
    }

    pub fn swap_blocks(&self, src_cache_id: i64, dst_cache_id: i64, src_to_dst: &HashMap<u32, u32>) -> Result<()> {
        use crate::types::Placement;
        let src = self.registry.get(src_cache_id)?;
        let dst = self.registry.get(dst_cache_id)?;
        if !src.is_blocks_cache() || !dst.is_blocks_cache() {
            return Err(EngineError::param_invalid("swap_blocks requires blocks caches"));
        }
        let is_swap_in = src.desc.placement == Placement::Host && dst.desc.placement == Placement::Device;
        let is_swap_out = src.desc.placement == Placement::Device && dst.desc.placement == Placement::Host;
        if !is_swap_in && !is_swap_out {
            return Err(EngineError::param_invalid("swap_blocks only supports Host<->Device"));
        }
        let src_block_size = src.desc.size()? / src.desc.batch_size().max(1);
        let dst_block_size = dst.desc.size()? / dst.desc.batch_size().max(1);
        if src_block_size != dst_block_size {
            return Err(EngineError::param_invalid("swap_blocks requires matching block sizes"));
        }
        if src.desc.num_tensors != dst.desc.num_tensors {
            return Err(EngineError::param_invalid("swap_blocks requires matching tensor counts"));
        }
        for (&s, &d) in src_to_dst {
            if s as i64 >= src.desc.batch_size() || d as i64 >= dst.desc.batch_size() {
                return Err(EngineError::param_invalid("swap_blocks block index out of range"));
            }
            self.transport.transfer_layer(0, s as usize, d as usize)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use crate::types::{CacheDesc, DataType, Placement};

    fn engine() -> (TransferEngine, Arc<CacheRegistry>) {
        let registry = Arc::new(CacheRegistry::new(
            Arc::new(MemoryPool::configured(Placement::Device, 1 << 20)),
            Arc::new(MemoryPool::configured(Placement::Host, 1 << 20)),
        ));
        let engine = TransferEngine::new(registry.clone(), Arc::new(LoopbackTransport));
        (engine, registry)
    }

    #[tokio::test]
    async fn async_transfer_reports_success_for_every_destination() {
        let (engine, registry) = engine();
        let desc = CacheDesc::new(10, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let src_id = registry.allocate_cache(desc, &[]).unwrap();

        let cfg = TransferConfig {
            dst_cluster_id: 1,
            dst_addrs: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            src_layer_range: None,
            src_batch_index: 0,
        };
        let task = engine
            .transfer_cache_async(src_id, Arc::new(AlwaysReady), vec![cfg], vec![], 2)
            .unwrap();
        let results = task.get_results(Some(1000)).await;
        assert_eq!(results, vec![StatusCode::Success]);
    }

    struct NeverReady;
    #[async_trait]
    impl LayerSynchronizer for NeverReady {
        async fn synchronize_layer(&self, _layer_index: usize, _timeout_ms: u64) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn async_transfer_surfaces_sync_layer_failure() {
        let (engine, registry) = engine();
        let desc = CacheDesc::new(10, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let src_id = registry.allocate_cache(desc, &[]).unwrap();

        let cfg = TransferConfig {
            dst_cluster_id: 1,
            dst_addrs: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            src_layer_range: None,
            src_batch_index: 0,
        };
        let task = engine
            .transfer_cache_async(src_id, Arc::new(NeverReady), vec![cfg], vec![], 2)
            .unwrap();
        let status = task.synchronize(Some(1000)).await;
        assert_eq!(status, StatusCode::SyncLayerFailed);
    }

    #[tokio::test]
    async fn async_transfer_sync_failure_fails_every_pending_destination() {
        let (engine, registry) = engine();
        let desc = CacheDesc::new(10, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let src_id = registry.allocate_cache(desc, &[]).unwrap();

        let cfg0 = TransferConfig {
            dst_cluster_id: 1,
            dst_addrs: vec![1, 2, 3, 4, 5, 6],
            src_layer_range: Some(LayerRange::new(0, 3).unwrap()),
            src_batch_index: 0,
        };
        let cfg1 = TransferConfig {
            dst_cluster_id: 2,
            dst_addrs: vec![1, 2, 3, 4],
            src_layer_range: Some(LayerRange::new(2, 4).unwrap()),
            src_batch_index: 0,
        };
        let task = engine
            .transfer_cache_async(src_id, Arc::new(NeverReady), vec![cfg0, cfg1], vec![], 2)
            .unwrap();
        let results = task.get_results(Some(1000)).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], StatusCode::SyncLayerFailed);
        assert!(matches!(results[1], StatusCode::SyncLayerFailed | StatusCode::Timeout));
    }

    #[test]
    fn odd_tensor_count_with_default_tensor_num_per_layer_is_rejected() {
        let (engine, registry) = engine();
        let desc = CacheDesc::new(9, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let src_id = registry.allocate_cache(desc, &[]).unwrap();
        let err = engine
            .transfer_cache_async(src_id, Arc::new(AlwaysReady), vec![], vec![], 2)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
    }

    #[test]
    fn push_cache_requires_full_size() {
        let (engine, registry) = engine();
        let desc = CacheDesc::new(4, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let src_id = registry.allocate_cache(desc, &[]).unwrap();
        let dst = CacheKeyByIdAndIndex::new(1, 7, 0);
        let err = engine.push_cache(src_id, dst, 16, None, None, 2).unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
        engine.push_cache(src_id, dst, -1, None, None, 2).unwrap();
    }

    #[test]
    fn pull_cache_consumes_key_so_second_pull_fails() {
        let (engine, registry) = engine();
        let src_desc = CacheDesc::new(2, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let key = CacheKey::new(1, 0, 1, crate::types::INVALID_ID).unwrap();
        registry.allocate_cache(src_desc, &[key]).unwrap();

        let dst_desc = CacheDesc::new(2, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let dst_id = registry.allocate_cache(dst_desc, &[]).unwrap();

        engine.pull_cache(&key, dst_id, 0, -1).unwrap();
        let err = engine.pull_cache(&key, dst_id, 0, -1).unwrap_err();
        assert_eq!(err.status(), StatusCode::KvCacheNotExist);
    }

    #[test]
    fn pull_blocks_rejects_non_empty_src_blocks_for_cache_key_source() {
        let (engine, registry) = engine();
        let src_desc = CacheDesc::new(2, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let key = CacheKey::new(1, 0, 1, crate::types::INVALID_ID).unwrap();
        registry.allocate_cache(src_desc, &[key]).unwrap();

        let mut dst_desc = CacheDesc::new(2, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        dst_desc.is_blocks = true;
        let dst_id = registry.allocate_blocks_cache(dst_desc, None).unwrap();

        let err = engine.pull_blocks(PullSource::Cache(&key), dst_id, &[0], &[0]).unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
        engine.pull_blocks(PullSource::Cache(&key), dst_id, &[], &[0]).unwrap();
    }

    #[test]
    fn push_blocks_rejects_mismatched_block_lists() {
        let (engine, registry) = engine();
        let desc = CacheDesc::new(4, vec![2, 8], DataType::Float16, Placement::Device).unwrap();
        let src_id = registry.allocate_blocks_cache(desc, None).unwrap();
        let dst = CacheKeyByIdAndIndex::new(1, 7, 0);
        let err = engine.push_blocks(src_id, dst, &[0, 1], &[0]).unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
        engine.push_blocks(src_id, dst, &[0, 1], &[0, 1]).unwrap();
    }
}
