//! Alarmflow server binary.
//!
//! Wires the controller to the in-process bus, reader and store backends
//! and runs until SIGTERM. Deployment-specific backends (Kafka, Redis) plug
//! in through the same seams.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use alarmflow_server::bus::MemoryBus;
use alarmflow_server::reader::MemoryUveReader;
use alarmflow_server::store::{MemoryStoreCluster, StoreConnector};
use alarmflow_server::{Config, Controller, Seams};

#[derive(Debug, Parser)]
#[command(name = "alarmflow", about = "UVE aggregation and alarm generation service")]
struct Args {
    /// Host IP this instance identifies as.
    #[arg(long, env = "ALARMFLOW_HOST_IP", default_value = "127.0.0.1")]
    host_ip: String,

    /// Worker instance id.
    #[arg(long, env = "ALARMFLOW_INSTANCE_ID", default_value = "0")]
    instance_id: String,

    /// Message-bus bootstrap endpoints.
    #[arg(long, env = "ALARMFLOW_BUS_BROKERS", value_delimiter = ',',
          default_value = "127.0.0.1:9092")]
    bus_brokers: Vec<String>,

    /// Topic prefix for the per-partition UVE topics.
    #[arg(long, env = "ALARMFLOW_TOPIC_PREFIX", default_value = "aggr")]
    topic_prefix: String,

    /// Number of partitions in the UVE key space.
    #[arg(long, env = "ALARMFLOW_PARTITIONS", default_value_t = 30)]
    partitions: u32,

    /// Aggregate store replica endpoints, tried in order.
    #[arg(long, env = "ALARMFLOW_STORE_ENDPOINTS", value_delimiter = ',',
          default_value = "127.0.0.1:6379")]
    store_endpoints: Vec<String>,

    /// Maximum rows per pipelined store batch.
    #[arg(long, default_value_t = 20)]
    max_out_rows: usize,

    /// Introspect port advertised inside alarm tokens.
    #[arg(long, default_value_t = 5995)]
    introspect_port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config {
        host_ip: args.host_ip,
        instance_id: args.instance_id,
        bus_brokers: args.bus_brokers,
        topic_prefix: args.topic_prefix,
        partition_count: args.partitions,
        store_endpoints: args.store_endpoints,
        max_out_rows: args.max_out_rows,
        introspect_port: args.introspect_port,
        ..Config::default()
    };
    let member = config.member_id();
    info!(member, partitions = config.partition_count, "starting alarmflow");

    let bus = Arc::new(MemoryBus::new());
    let reader = Arc::new(MemoryUveReader::new());
    let cluster = Arc::new(MemoryStoreCluster::new());
    let controller = Controller::new(
        config,
        Seams {
            bus_factory: Arc::new(Arc::clone(&bus)),
            bus_producer: bus,
            store_connector: cluster as Arc<dyn StoreConnector>,
            reader,
        },
    );

    // Until a discovery feed is attached, this instance owns everything.
    let _ = controller.membership_sender().send(vec![member]).await;

    let code = controller.run().await;
    info!(code, "alarmflow stopped");
    ExitCode::from(u8::try_from(code).unwrap_or(2))
}
