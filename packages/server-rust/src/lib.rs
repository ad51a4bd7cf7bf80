//! Alarmflow server -- partition-sharded UVE aggregation and alarm
//! generation.
//!
//! Agents across the cluster emit UVEs into a partitioned message bus. Each
//! owned partition gets a consumer task that tracks contributors and marks
//! changed keys; the aggregation loop merges contributions into one view
//! per key, publishes type-level deltas to the aggregate store under the
//! partition's epoch, and runs the alarm rules and their hysteresis state
//! machines against the merged view. Partition ownership follows a
//! rendezvous-hash assignment over the member list.

pub mod aggregator;
pub mod alarms;
pub mod bus;
pub mod config;
pub mod configfeed;
pub mod consumer;
pub mod controller;
pub mod introspect;
pub mod manager;
pub mod reader;
pub mod state;
pub mod stats;
pub mod store;

pub use config::Config;
pub use controller::{Controller, Seams};

/// End-to-end flows over the in-memory bus, reader and store.
#[cfg(test)]
mod integration_tests {
    use std::collections::BTreeSet;
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use alarmflow_core::partition::partition_of;
    use alarmflow_core::uve::ALARMS_TYPE;
    use serde_json::{json, Value};

    use crate::bus::MemoryBus;
    use crate::config::Config;
    use crate::controller::{Controller, Seams};
    use crate::introspect::{AlarmAckRequest, AlarmAckResponse};
    use crate::reader::MemoryUveReader;
    use crate::store::{MemoryStoreCluster, StoreConnector};

    const COLL: &str = "coll-1:6379";
    const GEN_A: &str = "host-a:vrouter:agent:0";
    const GEN_B: &str = "host-b:vrouter:agent:0";

    struct Fabric {
        controller: Arc<Controller>,
        bus: Arc<MemoryBus>,
        reader: Arc<MemoryUveReader>,
        partition_count: u32,
    }

    impl Fabric {
        async fn bring_up(&self) {
            let parts: BTreeSet<u32> = (0..self.partition_count).collect();
            assert!(self.controller.manager.partition_change(&parts, true).await);
        }

        /// Publishes one generator contribution: the bus notification plus
        /// the readable value, like a collector relays it.
        fn emit(&self, generator: &str, key: &str, typ: &str, value: Option<Value>) {
            let part = partition_of(key, self.partition_count);
            match &value {
                Some(v) => self.reader.set(COLL, generator, key, typ, v.clone()),
                None => self.reader.withdraw(generator, key, typ),
            }
            self.bus
                .publish(part, &format!("{key}|{typ}|{generator}|{COLL}"), value);
        }

        /// Lets the consumers pick up pending notifications, then runs
        /// aggregation cycles until `cond` holds.
        async fn settle<Fut: Future<Output = bool>>(&self, cond: impl Fn() -> Fut) {
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.controller
                    .aggregator
                    .run_cycle()
                    .await
                    .expect("aggregation cycle");
                if cond().await {
                    return;
                }
            }
            panic!("condition not reached");
        }

        fn register_rule(&self, doc: Value) {
            let cfg = serde_json::from_value(doc).unwrap();
            self.controller
                .registry
                .write()
                .register(Arc::new(crate::alarms::ConfiguredRule::new(cfg)));
        }

        async fn stored_alarms(&self, key: &str) -> Option<Value> {
            let part = partition_of(key, self.partition_count);
            self.controller
                .store
                .read_value(part, key, ALARMS_TYPE)
                .await
                .unwrap()
        }

        async fn stored_value(&self, key: &str, typ: &str) -> Option<Value> {
            let part = partition_of(key, self.partition_count);
            self.controller.store.read_value(part, key, typ).await.unwrap()
        }
    }

    fn fabric() -> Fabric {
        let config = Config {
            partition_count: 4,
            partition_wait_secs: 10,
            worker_join_secs: 2,
            ..Config::default()
        };
        let bus = Arc::new(MemoryBus::new());
        let reader = Arc::new(MemoryUveReader::new());
        reader.add_collector(COLL);
        let cluster = Arc::new(MemoryStoreCluster::new());
        let controller = Controller::new(
            config,
            Seams {
                bus_factory: Arc::new(Arc::clone(&bus)),
                bus_producer: Arc::clone(&bus) as Arc<dyn crate::bus::BusProducer>,
                store_connector: Arc::clone(&cluster) as Arc<dyn StoreConnector>,
                reader: Arc::clone(&reader) as Arc<dyn crate::reader::UveReader>,
            },
        );
        Fabric {
            controller,
            bus,
            reader,
            partition_count: 4,
        }
    }

    fn down_rule(active_timer: u32) -> Value {
        json!({
            "name": "x-down",
            "uve_keys": ["T"],
            "severity": 1,
            "description": "X is down",
            "alarm_rules": {"or_list": [{"and_list": [{
                "operation": "==",
                "operand1": "UveX.s",
                "operand2": {"json_value": "\"DOWN\""}
            }]}]},
            "active_timer": active_timer
        })
    }

    #[tokio::test]
    async fn simple_assert_and_clear() {
        let f = fabric();
        f.register_rule(down_rule(0));
        f.bring_up().await;

        let key = "T:k1";
        let part = partition_of(key, f.partition_count);
        let mut rx = f.controller.store.subscribe(part).await.unwrap();

        f.emit(GEN_A, key, "UveX", Some(json!({"s": {"@type": "string", "#text": "DOWN"}})));
        f.settle(|| async { f.stored_alarms(key).await.is_some() }).await;

        let alarms = f.stored_alarms(key).await.unwrap();
        assert_eq!(alarms["name"], json!("k1"));
        assert_eq!(alarms["alarms"][0]["type"], json!("x-down"));
        assert_eq!(alarms["alarms"][0]["ack"], json!(false));

        // The channel announced the alarm struct.
        let mut saw_alarm_type = false;
        while let Ok(msg) = rx.try_recv() {
            let list: Vec<Value> = serde_json::from_str(&msg).unwrap();
            if list.iter().any(|e| e["key"] == json!(key) && e["type"] == json!(ALARMS_TYPE)) {
                saw_alarm_type = true;
            }
        }
        assert!(saw_alarm_type);

        // Clear: the struct disappears from the store.
        f.emit(GEN_A, key, "UveX", Some(json!({"s": {"@type": "string", "#text": "UP"}})));
        f.settle(|| async { f.stored_alarms(key).await.is_none() }).await;

        let mut saw_withdraw = false;
        while let Ok(msg) = rx.try_recv() {
            let list: Vec<Value> = serde_json::from_str(&msg).unwrap();
            if list.iter().any(|e| e["key"] == json!(key) && e["type"] == json!(ALARMS_TYPE)) {
                saw_withdraw = true;
            }
        }
        assert!(saw_withdraw);
    }

    #[tokio::test]
    async fn soaking_alarm_stays_unpublished() {
        let f = fabric();
        f.register_rule(down_rule(5));
        f.bring_up().await;

        let key = "T:k2";
        f.emit(GEN_A, key, "UveX", Some(json!({"s": {"@type": "string", "#text": "DOWN"}})));
        f.settle(|| async { f.stored_value(key, "UveX").await.is_some() }).await;

        // Asserted but soaking: nothing published.
        assert!(f.stored_alarms(key).await.is_none());

        // Cleared before the soak expires: still nothing, record gone.
        f.emit(GEN_A, key, "UveX", Some(json!({"s": {"@type": "string", "#text": "UP"}})));
        f.settle(|| async { f.controller.state.alarms.lock().tables().is_empty() }).await;
        assert!(f.stored_alarms(key).await.is_none());
    }

    #[tokio::test]
    async fn struct_sum_aggregates_across_generators() {
        let f = fabric();
        f.bring_up().await;

        let key = "T:k3";
        let mk = |n: &str| {
            json!({"counters": {"@type": "struct", "@aggtype": "sum",
                "CounterSet": {"a": {"@type": "i64", "#text": n}}}})
        };
        f.emit(GEN_A, key, "UveX", Some(mk("3")));
        f.emit(GEN_B, key, "UveX", Some(mk("5")));

        f.settle(|| async {
            f.stored_value(key, "UveX")
                .await
                .is_some_and(|v| v["counters"]["CounterSet"]["a"]["#text"] == json!("8"))
        })
        .await;
    }

    #[tokio::test]
    async fn replaying_a_notification_is_idempotent() {
        let f = fabric();
        f.bring_up().await;

        let key = "T:k4";
        let part = partition_of(key, f.partition_count);
        let payload = json!({"s": {"@type": "string", "#text": "UP"}});
        f.emit(GEN_A, key, "UveX", Some(payload.clone()));
        f.settle(|| async { f.stored_value(key, "UveX").await.is_some() }).await;

        let before = f.stored_value(key, "UveX").await;
        let keys_before = f.controller.store.partition_keys(part).await.unwrap();

        // Same notification again: at-least-once delivery replays.
        f.bus
            .publish(part, &format!("{key}|UveX|{GEN_A}|{COLL}"), Some(payload));
        tokio::time::sleep(Duration::from_millis(300)).await;
        f.controller.aggregator.run_cycle().await.unwrap();

        assert_eq!(f.stored_value(key, "UveX").await, before);
        assert_eq!(
            f.controller.store.partition_keys(part).await.unwrap(),
            keys_before
        );
    }

    #[tokio::test]
    async fn withdrawn_contribution_tombstones_the_key() {
        let f = fabric();
        f.bring_up().await;

        let key = "T:k5";
        let part = partition_of(key, f.partition_count);
        f.emit(GEN_A, key, "UveX", Some(json!({"s": {"@type": "string", "#text": "UP"}})));
        f.settle(|| async {
            f.controller.store.partition_keys(part).await.unwrap().contains(key)
        })
        .await;

        f.emit(GEN_A, key, "UveX", None);
        f.settle(|| async {
            f.controller.store.partition_keys(part).await.unwrap().is_empty()
        })
        .await;
        assert_eq!(f.stored_value(key, "UveX").await, None);
    }

    #[tokio::test]
    async fn acknowledgement_round_trip() {
        let f = fabric();
        f.register_rule(down_rule(0));
        f.bring_up().await;

        let key = "T:k6";
        f.emit(GEN_A, key, "UveX", Some(json!({"s": {"@type": "string", "#text": "DOWN"}})));
        f.settle(|| async { f.stored_alarms(key).await.is_some() }).await;
        let ts = f.stored_alarms(key).await.unwrap()["alarms"][0]["timestamp"]
            .as_i64()
            .unwrap();

        let bad = AlarmAckRequest {
            table: "T".to_string(),
            name: "k6".to_string(),
            alarm_type: "x-down".to_string(),
            timestamp: ts + 1,
        };
        assert_eq!(
            f.controller.handle_alarm_ack(&bad).await,
            AlarmAckResponse::InvalidAlarmRequest
        );

        let good = AlarmAckRequest { timestamp: ts, ..bad };
        assert_eq!(
            f.controller.handle_alarm_ack(&good).await,
            AlarmAckResponse::Success
        );
        // Idempotent re-ack, and the stored copy carries the flag.
        assert_eq!(
            f.controller.handle_alarm_ack(&good).await,
            AlarmAckResponse::Success
        );
        let alarms = f.stored_alarms(key).await.unwrap();
        assert_eq!(alarms["alarms"][0]["ack"], json!(true));
    }

    #[tokio::test]
    async fn introspect_reflects_consumed_state() {
        let f = fabric();
        f.bring_up().await;

        let key = "T:k7";
        f.emit(GEN_A, key, "UveX", Some(json!({"s": {"@type": "string", "#text": "UP"}})));
        f.settle(|| async { f.stored_value(key, "UveX").await.is_some() }).await;

        let part = partition_of(key, f.partition_count);
        let status = f.controller.handle_partition_status(i64::from(part));
        assert!(status[0].enabled);
        let info = f.controller.handle_uve_table_info(part);
        assert_eq!(info.tables.len(), 1);
        assert_eq!(info.tables[0].table, "T");
        assert_eq!(info.tables[0].uves[0].name, "k7");

        let perf = f.controller.handle_uve_table_perf("all");
        // Nothing collected yet; the perf report covers the previous period.
        assert!(perf.is_empty());
        let _ = f.controller.state.stats.lock().collect();
        let perf = f.controller.handle_uve_table_perf("T");
        assert_eq!(perf.len(), 1);
        assert!(perf[0].updates > 0);
    }
}
