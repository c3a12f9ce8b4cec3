//! Identifier & descriptor types: `CacheDesc`, the three cache-key shapes,
//! `MemInfo`, and the transfer-configuration variants.

use crate::error::{EngineError, Result, StatusCode};

pub const INVALID_ID: u64 = u64::MAX;

pub fn is_valid_id(id: u64) -> bool {
    id != INVALID_ID
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Float16,
    Bf16,
    Int8,
    Int16,
    Uint16,
    Uint8,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Bool,
    Double,
}

impl DataType {
    /// Width in bytes of a single element.
    pub fn byte_width(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::Uint8 => 1,
            DataType::Float16 | DataType::Bf16 | DataType::Int16 | DataType::Uint16 => 2,
            DataType::Float | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Double => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    Host,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Memtype {
    Device,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMemStatus {
    Ok,
    Preparing,
    Failed,
}

/// Shape, dtype and placement of every tensor backing a `Cache`.
#[derive(Debug)]
pub struct CacheDesc {
    pub num_tensors: u32,
    pub shape: Vec<i64>,
    pub data_type: DataType,
    pub placement: Placement,
    pub batch_dim_index: usize,
    pub seq_len_dim_index: Option<usize>,
    pub is_blocks: bool,
    size_cache: std::sync::atomic::AtomicI64,
}

const SIZE_UNSET: i64 = -1;

impl CacheDesc {
    pub fn new(
        num_tensors: u32,
        shape: Vec<i64>,
        data_type: DataType,
        placement: Placement,
    ) -> Result<Self> {
        if num_tensors == 0 {
            return Err(EngineError::param_invalid("num_tensors must be >= 1"));
        }
        if shape.is_empty() {
            return Err(EngineError::param_invalid("shape must be non-empty"));
        }
        if shape.contains(&0) {
            return Err(EngineError::param_invalid("shape dims must be non-zero"));
        }
        Ok(Self {
            num_tensors,
            shape,
            data_type,
            placement,
            batch_dim_index: 0,
            seq_len_dim_index: None,
            is_blocks: false,
            size_cache: std::sync::atomic::AtomicI64::new(SIZE_UNSET),
        })
    }

    pub fn update_dim(&mut self, batch_dim_index: usize, seq_len_dim_index: Option<usize>) -> Result<()> {
        if batch_dim_index >= self.shape.len() {
            return Err(EngineError::param_invalid("batch_dim_index out of range"));
        }
        if let Some(idx) = seq_len_dim_index {
            if idx >= self.shape.len() {
                return Err(EngineError::param_invalid("seq_len_dim_index out of range"));
            }
        }
        self.batch_dim_index = batch_dim_index;
        self.seq_len_dim_index = seq_len_dim_index;
        self.size_cache.store(SIZE_UNSET, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Total byte size of a single tensor: product of shape dims times dtype width.
    pub fn size(&self) -> Result<i64> {
        let cached = self.size_cache.load(std::sync::atomic::Ordering::Relaxed);
        if cached != SIZE_UNSET {
            return Ok(cached);
        }
        let mut total: i64 = 1;
        for &dim in &self.shape {
            total = total
                .checked_mul(dim)
                .ok_or_else(|| EngineError::param_invalid("shape overflows i64 while computing size"))?;
        }
        total = total
            .checked_mul(self.data_type.byte_width() as i64)
            .ok_or_else(|| EngineError::param_invalid("size overflows i64"))?;
        self.size_cache.store(total, std::sync::atomic::Ordering::Relaxed);
        Ok(total)
    }

    pub fn batch_size(&self) -> i64 {
        self.shape[self.batch_dim_index]
    }
}

impl Clone for CacheDesc {
    fn clone(&self) -> Self {
        Self {
            num_tensors: self.num_tensors,
            shape: self.shape.clone(),
            data_type: self.data_type,
            placement: self.placement,
            batch_dim_index: self.batch_dim_index,
            seq_len_dim_index: self.seq_len_dim_index,
            is_blocks: self.is_blocks,
            size_cache: std::sync::atomic::AtomicI64::new(
                self.size_cache.load(std::sync::atomic::Ordering::Relaxed),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemInfo {
    pub mem_type: Memtype,
    pub addr: u64,
    pub size: u64,
}

impl MemInfo {
    pub fn new(mem_type: Memtype, addr: u64, size: u64) -> Result<Self> {
        if addr == 0 {
            return Err(EngineError::param_invalid("MemInfo.addr must be non-zero"));
        }
        if size == 0 {
            return Err(EngineError::param_invalid("MemInfo.size must be > 0"));
        }
        Ok(Self { mem_type, addr, size })
    }
}

/// Addresses a cache owned by a remote prompt cluster, by request id or prefix id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub cluster_id: u64,
    pub req_id: u64,
    pub model_id: u64,
    pub prefix_id: u64,
}

impl CacheKey {
    pub fn new(cluster_id: u64, req_id: u64, model_id: u64, prefix_id: u64) -> Result<Self> {
        let req_valid = is_valid_id(req_id);
        let prefix_valid = is_valid_id(prefix_id);
        if req_valid == prefix_valid {
            return Err(EngineError::param_invalid(
                "CacheKey requires exactly one of req_id / prefix_id to be valid",
            ));
        }
        Ok(Self {
            cluster_id,
            req_id,
            model_id,
            prefix_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKeyByIdAndIndex {
    pub cluster_id: u64,
    pub cache_id: i64,
    pub batch_index: u32,
}

impl CacheKeyByIdAndIndex {
    pub fn new(cluster_id: u64, cache_id: i64, batch_index: u32) -> Self {
        Self {
            cluster_id,
            cache_id,
            batch_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlocksCacheKey {
    pub cluster_id: u64,
    pub model_id: u64,
}

impl BlocksCacheKey {
    pub fn new(cluster_id: u64, model_id: u64) -> Self {
        Self { cluster_id, model_id }
    }
}

/// Half-open, unit-step layer range `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRange {
    pub start: usize,
    pub stop: usize,
}

impl LayerRange {
    pub fn new(start: usize, stop: usize) -> Result<Self> {
        if start >= stop {
            return Err(EngineError::param_invalid("layer range must satisfy start < stop"));
        }
        Ok(Self { start, stop })
    }

    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    pub fn contains(&self, layer: usize) -> bool {
        layer >= self.start && layer < self.stop
    }
}

/// Address-based destination of an async layer-pipelined transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub dst_cluster_id: u64,
    pub dst_addrs: Vec<u64>,
    pub src_layer_range: Option<LayerRange>,
    pub src_batch_index: u32,
}

/// Cache-key-based destination of an async layer-pipelined transfer; requires
/// `enable_remote_cache_accessible`.
#[derive(Debug, Clone)]
pub struct TransferWithCacheKeyConfig {
    pub cache_key: CacheKeyByIdAndIndex,
    pub src_layer_range: Option<LayerRange>,
    pub dst_layer_range: Option<LayerRange>,
    pub src_batch_index: u32,
}

impl TransferWithCacheKeyConfig {
    pub fn validate(&self) -> Result<()> {
        if let (Some(src), Some(dst)) = (self.src_layer_range, self.dst_layer_range) {
            if src.len() != dst.len() {
                return Err(EngineError::param_invalid(
                    "src_layer_range and dst_layer_range must have equal length",
                ));
            }
        }
        Ok(())
    }
}

pub fn status_or_err(code: StatusCode) -> Result<()> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(EngineError::new(code, "operation failed"))
    }
}
