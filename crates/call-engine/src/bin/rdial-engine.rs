//! rdial-engine - runs the dialer, the answered-call listener and the call
//! state projector against one switch, one database and one Redis

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rdial_call_engine::call_state::{CallStateCoordinator, CallStateProjector, CallStateStore, PROJECTOR_GROUP};
use rdial_call_engine::config::CallEngineConfig;
use rdial_call_engine::dialer::{Hopper, ReconcileSweep};
use rdial_call_engine::fronter::{Fronter, FronterServer};
use rdial_call_engine::store::{connect_pool, CallStore, LeadStore, PgCallStore, PgLeadStore};
use rdial_call_engine::VERSION;
use rdial_event_bus::{channels, EventBus, RedisStore};
use rdial_infra_common::{log_welcome, setup_logging};
use rdial_switch_control::InboundConnector;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rdial-engine", version)]
#[command(about = "Outbound dialer, answered-call flow and call state projector")]
struct Args {
    /// Configuration file; RDIAL__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides logging.level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    /// Consumer name of this process in the projector group
    #[arg(long, env = "RDIAL_CONSUMER_NAME")]
    consumer: Option<String>,

    /// Do not run the dialer loop and reconcile sweep
    #[arg(long)]
    no_dialer: bool,

    /// Do not listen for answered calls
    #[arg(long)]
    no_fronter: bool,

    /// Do not project call events into the call stores
    #[arg(long)]
    no_projector: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CallEngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    setup_logging(&config.logging).context("setting up logging")?;
    log_welcome("rdial-engine", VERSION);

    let pool = connect_pool(&config.store.database_url, config.store.max_connections)
        .await
        .context("connecting to Postgres")?;
    let fast = Arc::new(
        RedisStore::connect(
            &config.store.redis_url,
            Duration::from_millis(config.store.redis_timeout_ms),
        )
        .await
        .context("connecting to Redis")?,
    );
    info!("🗄️ Connected to Postgres and Redis");

    let bus = EventBus::with_store(fast.clone(), config.events.clone());
    bus.initialize().await.context("creating event consumer group")?;

    let leads: Arc<dyn LeadStore> = Arc::new(PgLeadStore::new(pool.clone()));
    let calls: Arc<dyn CallStore> = Arc::new(PgCallStore::new(pool.clone()));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut components = JoinSet::new();

    if args.no_dialer {
        info!("Dialer disabled");
    } else {
        let connector = Arc::new(InboundConnector::new(config.switch.inbound()));
        let hopper = Hopper::new(config.dialer.clone(), connector, leads.clone(), fast.clone(), bus.clone());
        let stop = stop_rx.clone();
        components.spawn(async move { hopper.run(stop).await });

        let sweep = ReconcileSweep::new(
            leads.clone(),
            Duration::from_secs(config.dialer.reconcile_interval_secs),
            Duration::from_secs(config.dialer.dialing_grace_secs),
        );
        let stop = stop_rx.clone();
        components.spawn(async move { sweep.run(stop).await });
    }

    if args.no_fronter {
        info!("Fronter disabled");
    } else {
        let fronter = Arc::new(Fronter::new(config.fronter.clone(), leads.clone(), bus.clone()));
        let server = FronterServer::bind(&config.fronter.listen_address(), config.fronter.outbound(), fronter)
            .await
            .context("binding the answered-call listener")?;
        components.spawn(server.run(stop_rx.clone()));
    }

    let projection = if args.no_projector {
        info!("Call state projector disabled");
        None
    } else {
        let states = CallStateStore::new(fast.clone(), Duration::from_secs(config.call_state.ttl_secs));
        let projector = CallStateProjector::new(CallStateCoordinator::new(states, calls.clone()));
        let consumer = args
            .consumer
            .unwrap_or_else(|| format!("engine-{}", std::process::id()));
        Some(
            bus.subscribe_in_group(PROJECTOR_GROUP, channels::CALL, projector, &consumer)
                .await
                .context("subscribing the call state projector")?,
        )
    };

    if components.is_empty() && projection.is_none() {
        warn!("Every component is disabled, nothing to do");
        return Ok(());
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("🛑 Shutting down");

    let _ = stop_tx.send(true);
    if let Some(subscription) = projection {
        subscription.unsubscribe().await;
    }
    while let Some(finished) = components.join_next().await {
        if let Err(e) = finished {
            warn!("Component ended abnormally: {}", e);
        }
    }
    pool.close().await;

    info!("✅ rdial-engine stopped");
    Ok(())
}
