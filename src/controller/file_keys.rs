//! Input file-key enumeration and cluster sizing: list the objects behind
//! the execution's file key, then pick the number of sharding nodes from
//! the size-based lookup rules.

use crate::config::model::{ClusterSizingSpec, ClusterSpec, FileKeyInfo};
use crate::error::{PipeError, PipeResult};
use crate::s3::store::{StoreHandle, list_file_keys};

#[derive(Debug, Clone)]
pub struct ShardResult {
    pub file_keys: Vec<FileKeyInfo>,
    pub total_size_mb: i64,
    pub nbr_sharding_nodes: usize,
    /// reducing partitions; always equals the number of sharding nodes
    pub nbr_partitions: usize,
    pub sizing: ClusterSizingSpec,
}

impl ShardResult {
    pub fn first_key(&self) -> &str {
        &self.file_keys[0].key
    }
}

/// Enumerate the input keys (the key itself, or every object under it for
/// multi-part sources) and size the cluster.
pub async fn shard_file_keys(
    store: &StoreHandle,
    file_key: &str,
    is_part_files: bool,
    cluster: &ClusterSpec,
    default_nbr_nodes: usize,
) -> PipeResult<ShardResult> {
    let file_keys = if is_part_files {
        list_file_keys(store, file_key).await?
    } else {
        let mut keys = list_file_keys(store, file_key).await?;
        // an exact object key lists itself; keep only the named object
        keys.retain(|k| k.key == file_key);
        if keys.is_empty() {
            list_file_keys(store, file_key).await?
        } else {
            keys
        }
    };
    if file_keys.is_empty() {
        return Err(PipeError::system(format!(
            "no input objects found under file key '{file_key}'"
        )));
    }
    let total_size: i64 = file_keys.iter().map(|k| k.size).sum();
    let total_size_mb = total_size / (1024 * 1024);

    let (nbr_nodes, sizing) = pick_nbr_nodes(cluster, total_size_mb, default_nbr_nodes);
    Ok(ShardResult {
        file_keys,
        total_size_mb,
        nbr_sharding_nodes: nbr_nodes,
        nbr_partitions: nbr_nodes,
        sizing,
    })
}

/// The first lookup rule whose threshold is at or below the total input
/// size wins; without a match, the cluster's static `nbr_nodes` applies,
/// then the deployment default.
pub fn pick_nbr_nodes(
    cluster: &ClusterSpec,
    total_size_mb: i64,
    default_nbr_nodes: usize,
) -> (usize, ClusterSizingSpec) {
    if let Some(rules) = &cluster.nbr_nodes_lookup {
        for rule in rules {
            if total_size_mb >= rule.when_total_size_ge_mb && rule.nbr_nodes > 0 {
                return (rule.nbr_nodes, rule.clone());
            }
        }
    }
    let nodes = if cluster.nbr_nodes > 0 {
        cluster.nbr_nodes
    } else {
        default_nbr_nodes.max(1)
    };
    let sizing = ClusterSizingSpec {
        when_total_size_ge_mb: 0,
        nbr_nodes: nodes,
        s3_worker_pool_size: cluster.s3_worker_pool_size,
        use_ecs_tasks: false,
        max_concurrency: cluster.default_max_concurrency,
    };
    (nodes, sizing)
}
