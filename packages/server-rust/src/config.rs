//! Service-level configuration.

use alarmflow_core::partition::PARTITION_COUNT;

/// Configuration for one alarm generator instance.
///
/// The binary fills this from CLI flags and environment variables; tests
/// construct it directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host IP this instance identifies as. Together with `instance_id` it
    /// forms the member id used for partition ownership.
    pub host_ip: String,
    /// Worker instance id, distinguishing multiple instances on one host.
    pub instance_id: String,
    /// Module name written into the store liveness key.
    pub module_id: String,
    /// Message-bus bootstrap endpoints.
    pub bus_brokers: Vec<String>,
    /// Prefix of the per-partition UVE topics
    /// (`"<prefix>-uve-topic-<partition>"`).
    pub topic_prefix: String,
    /// Number of partitions in the UVE key space.
    pub partition_count: u32,
    /// Aggregate store replica endpoints, tried in order.
    pub store_endpoints: Vec<String>,
    /// UVE server endpoints the aggregator reads contributions from.
    pub uve_server_endpoints: Vec<String>,
    /// Alarm rule source endpoint.
    pub rule_source: String,
    /// Maximum rows per pipelined store batch.
    pub max_out_rows: usize,
    /// Keys processed per partition per aggregation cycle.
    pub max_keys_per_cycle: usize,
    /// Delay before the first bus health probe, seconds.
    pub health_probe_initial_secs: u64,
    /// Interval between bus health probes, seconds.
    pub health_probe_interval_secs: u64,
    /// Bound on waiting for a partition worker to start or stop, seconds.
    pub partition_wait_secs: u64,
    /// Bound on joining a stopping partition worker, seconds.
    pub worker_join_secs: u64,
    /// Introspect port advertised inside alarm tokens.
    pub introspect_port: u16,
}

impl Config {
    /// Member id used for partition ownership, `"<host_ip>:<instance_id>"`.
    #[must_use]
    pub fn member_id(&self) -> String {
        format!("{}:{}", self.host_ip, self.instance_id)
    }

    /// Bus topic carrying one partition's UVE notifications.
    #[must_use]
    pub fn partition_topic(&self, partition: u32) -> String {
        format!("{}-uve-topic-{partition}", self.topic_prefix)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            instance_id: "0".to_string(),
            module_id: "alarmflow".to_string(),
            bus_brokers: vec!["127.0.0.1:9092".to_string()],
            topic_prefix: "aggr".to_string(),
            partition_count: PARTITION_COUNT,
            store_endpoints: vec!["127.0.0.1:6379".to_string()],
            uve_server_endpoints: vec!["127.0.0.1:6380".to_string()],
            rule_source: "127.0.0.1:8082".to_string(),
            max_out_rows: 20,
            max_keys_per_cycle: 200,
            health_probe_initial_secs: 300,
            health_probe_interval_secs: 120,
            partition_wait_secs: 120,
            worker_join_secs: 60,
            introspect_port: 5995,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_id_joins_host_and_instance() {
        let cfg = Config {
            host_ip: "10.0.0.7".to_string(),
            instance_id: "2".to_string(),
            ..Config::default()
        };
        assert_eq!(cfg.member_id(), "10.0.0.7:2");
    }

    #[test]
    fn topic_uses_prefix_and_partition() {
        let cfg = Config::default();
        assert_eq!(cfg.partition_topic(7), "aggr-uve-topic-7");
    }

    #[test]
    fn defaults_match_deployment_knobs() {
        let cfg = Config::default();
        assert_eq!(cfg.max_out_rows, 20);
        assert_eq!(cfg.max_keys_per_cycle, 200);
        assert_eq!(cfg.health_probe_interval_secs, 120);
    }
}
