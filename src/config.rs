//! Engine configuration: parses the option map accepted by `Engine::init`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Prompt,
    Decoder,
    Mix,
}

#[derive(Debug, Deserialize)]
struct MemPoolCfgJson {
    memory_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub role: Option<Role>,
    pub listen_ip_info: Option<(String, u16)>,
    pub local_comm_res: Option<String>,
    pub enable_cache_manager: bool,
    pub enable_remote_cache_accessible: bool,
    pub enable_switch_role: bool,
    pub device_mem_pool_bytes: Option<u64>,
    pub host_mem_pool_bytes: Option<u64>,
    pub sync_kv_timeout_ms: u64,
}

impl EngineOptions {
    /// Parses the recognized `llm.*`-style option keys (see SPEC_FULL.md §6).
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self> {
        let mut opts = EngineOptions {
            sync_kv_timeout_ms: 3000,
            ..Default::default()
        };

        if let Some(v) = options.get("listen_ip_info") {
            opts.listen_ip_info = Some(parse_listen_ip_info(v)?);
        }
        if let Some(v) = options.get("local_comm_res") {
            if !v.is_empty() {
                opts.local_comm_res = Some(v.clone());
            }
        }
        let local_comm_res_present = opts.local_comm_res.is_some();

        opts.enable_cache_manager = options
            .get("enable_cache_manager")
            .map(|v| v == "1")
            .unwrap_or(local_comm_res_present);
        opts.enable_remote_cache_accessible = options
            .get("enable_remote_cache_accessible")
            .map(|v| v == "1")
            .unwrap_or(local_comm_res_present);
        opts.enable_switch_role = options
            .get("enable_switch_role")
            .map(|v| v == "1")
            .unwrap_or(false);

        if let Some(v) = options.get("mem_pool_cfg") {
            let parsed: MemPoolCfgJson = serde_json::from_str(v)
                .map_err(|e| EngineError::param_invalid(format!("invalid mem_pool_cfg: {e}")))?;
            opts.device_mem_pool_bytes = Some(parsed.memory_size);
        }
        if let Some(v) = options.get("host_mem_pool_cfg") {
            let parsed: MemPoolCfgJson = serde_json::from_str(v)
                .map_err(|e| EngineError::param_invalid(format!("invalid host_mem_pool_cfg: {e}")))?;
            opts.host_mem_pool_bytes = Some(parsed.memory_size);
        }
        if let Some(v) = options.get("sync_kv_timeout") {
            opts.sync_kv_timeout_ms = v
                .parse()
                .map_err(|_| EngineError::param_invalid("sync_kv_timeout must be a positive integer"))?;
        }

        Ok(opts)
    }
}

pub fn parse_listen_ip_info(listen_ip_info: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = listen_ip_info.splitn(2, ':').collect();
    if parts.len() != 2 {
        return Err(EngineError::param_invalid("listen_ip_info must be \"ip:port\""));
    }
    let port: u16 = parts[1]
        .parse()
        .map_err(|_| EngineError::param_invalid("listen_ip_info port must be a valid u16"))?;
    Ok((parts[0].to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_comm_res_enables_cache_manager_by_default() {
        let mut map = HashMap::new();
        map.insert("local_comm_res".to_string(), "{\"foo\":1}".to_string());
        let opts = EngineOptions::from_map(&map).unwrap();
        assert!(opts.enable_cache_manager);
        assert!(opts.enable_remote_cache_accessible);
    }

    #[test]
    fn rejects_malformed_listen_ip_info() {
        let mut map = HashMap::new();
        map.insert("listen_ip_info".to_string(), "not-a-valid-endpoint".to_string());
        assert!(EngineOptions::from_map(&map).is_err());
    }
}
