//! Peer Link Manager: establishes and tears down communication channels to
//! remote clusters, in either rank-table (`link`/`unlink`) or explicit-
//! endpoint (`link_clusters`/`unlink_clusters`) mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{EngineError, Result, StatusCode};
use crate::types::RegisterMemStatus;

const MAX_CLUSTER_NAME: usize = 128;
const MAX_NODE_NUM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Ready,
    Failed,
    Closed,
}

pub struct RankTableLink {
    pub comm_id: u64,
    pub comm_name: String,
    pub cluster_rank_info: Vec<(u64, u64)>,
    pub state: LinkState,
}

#[derive(Debug, Clone)]
pub struct ClusterEndpoint {
    pub remote_cluster_id: u64,
    pub local_endpoints: Vec<String>,
    pub remote_endpoints: Vec<String>,
}

pub struct ClusterLink {
    pub remote_cluster_id: u64,
    pub state: LinkState,
}

/// Tracks every established link, in whichever of the two modes the caller
/// uses. A given `remote_cluster_id` may have at most one live link.
pub struct PeerLinkManager {
    next_comm_id: AtomicU64,
    rank_table_links: RwLock<HashMap<u64, RankTableLink>>,
    cluster_links: RwLock<HashMap<u64, ClusterLink>>,
}

impl Default for PeerLinkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerLinkManager {
    pub fn new() -> Self {
        Self {
            next_comm_id: AtomicU64::new(1),
            rank_table_links: RwLock::new(HashMap::new()),
            cluster_links: RwLock::new(HashMap::new()),
        }
    }

    pub fn has_any_link(&self) -> bool {
        !self.rank_table_links.read().is_empty() || !self.cluster_links.read().is_empty()
    }

    pub fn link(
        &self,
        comm_name: &str,
        cluster_rank_info: &HashMap<u64, u64>,
        _rank_table: &str,
    ) -> Result<u64> {
        if comm_name.is_empty() || comm_name.len() >= MAX_CLUSTER_NAME {
            return Err(EngineError::param_invalid("comm_name must be non-empty and < 128 chars"));
        }
        if cluster_rank_info.len() < 2 || cluster_rank_info.len() > MAX_NODE_NUM {
            return Err(EngineError::param_invalid("cluster_rank_info size must be in [2, 4]"));
        }
        let mut pairs: Vec<(u64, u64)> = cluster_rank_info.iter().map(|(&c, &r)| (c, r)).collect();
        pairs.sort_by_key(|&(_, rank)| rank);
        let ranks: Vec<u64> = pairs.iter().map(|&(_, r)| r).collect();
        if ranks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EngineError::param_invalid("cluster ranks must be ascending and unique"));
        }
        let cluster_ids: std::collections::HashSet<u64> = pairs.iter().map(|&(c, _)| c).collect();
        if cluster_ids.len() != pairs.len() {
            return Err(EngineError::param_invalid("duplicate cluster id in cluster_rank_info"));
        }

        let mut links = self.rank_table_links.write();
        for existing in links.values() {
            let existing_ids: std::collections::HashSet<u64> =
                existing.cluster_rank_info.iter().map(|&(c, _)| c).collect();
            if existing.state != LinkState::Closed && !existing_ids.is_disjoint(&cluster_ids) {
                return Err(EngineError::new(StatusCode::AlreadyLink, "cluster already linked"));
            }
        }

        let comm_id = self.next_comm_id.fetch_add(1, Ordering::Relaxed);
        links.insert(
            comm_id,
            RankTableLink {
                comm_id,
                comm_name: comm_name.to_string(),
                cluster_rank_info: pairs,
                state: LinkState::Ready,
            },
        );
        Ok(comm_id)
    }

    pub fn unlink(&self, comm_id: u64) -> Result<()> {
        let mut links = self.rank_table_links.write();
        match links.get_mut(&comm_id) {
            Some(link) => {
                link.state = LinkState::Closed;
                Ok(())
            }
            None => Err(EngineError::new(StatusCode::UnlinkFailed, "unknown comm_id")),
        }
    }

    pub fn query_register_mem_status(&self, comm_id: u64) -> Result<RegisterMemStatus> {
        let links = self.rank_table_links.read();
        let link = links
            .get(&comm_id)
            .ok_or_else(|| EngineError::new(StatusCode::NotYetLink, "unknown comm_id"))?;
        Ok(match link.state {
            LinkState::Ready => RegisterMemStatus::Ok,
            LinkState::Pending => RegisterMemStatus::Preparing,
            LinkState::Failed | LinkState::Closed => RegisterMemStatus::Failed,
        })
    }

    pub fn link_clusters(
        &self,
        clusters: &[ClusterEndpoint],
        timeout_ms: u64,
        requires_local_endpoints: bool,
    ) -> Result<(StatusCode, Vec<StatusCode>)> {
        if timeout_ms == 0 {
            return Err(EngineError::param_invalid("timeout_ms must be > 0"));
        }
        let _timeout = Duration::from_millis(timeout_ms);
        let mut per_cluster = Vec::with_capacity(clusters.len());
        let mut overall = StatusCode::Success;
        let mut links = self.cluster_links.write();

        for cluster in clusters {
            if requires_local_endpoints && cluster.local_ip_info_missing() {
                per_cluster.push(StatusCode::ParamInvalid);
                overall = StatusCode::Failed;
                continue;
            }
            if links
                .get(&cluster.remote_cluster_id)
                .is_some_and(|l| l.state == LinkState::Ready)
            {
                per_cluster.push(StatusCode::AlreadyLink);
                overall = StatusCode::Failed;
                continue;
            }
            links.insert(
                cluster.remote_cluster_id,
                ClusterLink {
                    remote_cluster_id: cluster.remote_cluster_id,
                    state: LinkState::Ready,
                },
            );
            per_cluster.push(StatusCode::Success);
        }
        Ok((overall, per_cluster))
    }

    pub fn unlink_clusters(
        &self,
        cluster_ids: &[u64],
        timeout_ms: u64,
        force: bool,
    ) -> Result<(StatusCode, Vec<StatusCode>)> {
        if timeout_ms == 0 {
            return Err(EngineError::param_invalid("timeout_ms must be > 0"));
        }
        let mut links = self.cluster_links.write();
        let mut per_cluster = Vec::with_capacity(cluster_ids.len());
        let mut overall = StatusCode::Success;
        for &id in cluster_ids {
            match links.get_mut(&id) {
                Some(link) => {
                    link.state = LinkState::Closed;
                    per_cluster.push(StatusCode::Success);
                }
                None if force => per_cluster.push(StatusCode::Success),
                None => {
                    per_cluster.push(StatusCode::UnlinkFailed);
                    overall = StatusCode::Failed;
                }
            }
        }
        links.retain(|_, l| l.state != LinkState::Closed);
        Ok((overall, per_cluster))
    }

    pub fn is_linked(&self, remote_cluster_id: u64) -> bool {
        self.cluster_links
            .read()
            .get(&remote_cluster_id)
            .is_some_and(|l| l.state == LinkState::Ready)
            || self
                .rank_table_links
                .read()
                .values()
                .any(|l| l.state == LinkState::Ready && l.cluster_rank_info.iter().any(|&(c, _)| c == remote_cluster_id))
    }
}

impl ClusterEndpoint {
    fn local_ip_info_missing(&self) -> bool {
        self.local_endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_then_unlink_then_relink() {
        let mgr = PeerLinkManager::new();
        let clusters = vec![ClusterEndpoint {
            remote_cluster_id: 1,
            local_endpoints: vec!["127.0.0.1:26000".into()],
            remote_endpoints: vec!["127.0.0.1:26008".into()],
        }];
        let (status, per) = mgr.link_clusters(&clusters, 5000, true).unwrap();
        assert_eq!(status, StatusCode::Success);
        assert_eq!(per, vec![StatusCode::Success]);

        let (status, _) = mgr.unlink_clusters(&[1], 5000, false).unwrap();
        assert_eq!(status, StatusCode::Success);

        let (status, _) = mgr.link_clusters(&clusters, 5000, true).unwrap();
        assert_eq!(status, StatusCode::Success);
    }

    #[test]
    fn duplicate_rank_table_link_rejected() {
        let mgr = PeerLinkManager::new();
        let mut ranks = HashMap::new();
        ranks.insert(1u64, 0u64);
        ranks.insert(2u64, 1u64);
        mgr.link("comm-a", &ranks, "{}").unwrap();
        let err = mgr.link("comm-b", &ranks, "{}").unwrap_err();
        assert_eq!(err.status(), StatusCode::AlreadyLink);
    }

    #[test]
    fn single_entry_cluster_rank_info_rejected() {
        let mgr = PeerLinkManager::new();
        let mut ranks = HashMap::new();
        ranks.insert(1u64, 0u64);
        let err = mgr.link("comm-solo", &ranks, "{}").unwrap_err();
        assert_eq!(err.status(), StatusCode::ParamInvalid);
    }
}
