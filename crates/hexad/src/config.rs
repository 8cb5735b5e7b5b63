use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All engine tunables, loaded once at startup and passed around as an
/// immutable `Arc` handle. Every field has a default so a partial (or
/// missing) configuration file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Selects the binary-search implementation of the transitive-path
    /// operator instead of the hash-map BFS.
    pub use_bin_search_transitive_path: bool,
    /// Number of geometry preprocessing workers. `0` means one per core.
    pub worker_count: u32,
    /// Triples per permutation block.
    pub block_size: u32,
    /// Words strictly longer than this are stored in the external
    /// vocabulary file and loaded on demand.
    pub externalisation_threshold: u32,
    /// Words per front-coded vocabulary block.
    pub vocabulary_block_size: u32,
    /// Capacity of the bounded queues connecting pipeline stages.
    pub queue_capacity: u32,
    /// How often streaming operators look at the cancellation handle.
    #[serde(with = "duration_millis")]
    pub cancellation_poll_interval: Duration,
    /// Size estimate of a transitive path with a fixed side; an upper bound
    /// observed on realistic predicates.
    pub transitive_path_bound_estimate: u64,
    /// Blow-up factor applied to the subtree estimate when both sides of a
    /// transitive path are free; the observed worst case of well-known
    /// predicates.
    pub transitive_path_unbound_factor: u64,
    /// Global budget for intermediate result tables, in bytes.
    pub memory_budget_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            use_bin_search_transitive_path: false,
            worker_count: 0,
            block_size: 10_000,
            externalisation_threshold: 1_000,
            vocabulary_block_size: 16,
            queue_capacity: 1_024,
            cancellation_poll_interval: Duration::from_millis(100),
            transitive_path_bound_estimate: 1_000,
            transitive_path_unbound_factor: 10_000,
            memory_budget_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get()
        } else {
            self.worker_count as usize
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "useBinSearchTransitivePath": true, "blockSize": 42 }"#)
                .unwrap();
        assert!(config.use_bin_search_transitive_path);
        assert_eq!(config.block_size, 42);
        assert_eq!(config.transitive_path_bound_estimate, 1_000);
        assert_eq!(config.transitive_path_unbound_factor, 10_000);
        assert_eq!(config.cancellation_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<EngineConfig>(r#"{ "blockSizes": 42 }"#);
        assert!(result.is_err());
    }
}
