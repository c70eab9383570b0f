use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::http::Method;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::filter_fn, layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

use crate::app_database::AppDatabase;
use crate::bank::merge::merge_utxos;
use crate::bank::obtain_bank_lease;
use crate::chains::rpc_node::RpcNode;
use crate::chains::{Chain, ChainRegistry, MiningNode, PayoutNode};
use crate::chart_database::ChartDatabase;
use crate::config::{ChainConfig, Config};
use crate::context::PoolContext;
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::Exchange;
use crate::kv::{Keys, KvStore, RedisKv};
use crate::locker::Locker;
use crate::notifier::Notifier;
use crate::stream::StreamFanout;
use crate::systems::{
    audit_system::audit_system, bank_system::bank_system, batch_system::batch_system,
    credit_system::credit_system, payout_system::payout_system, rollup_system, share_system::share_system,
    unlock_system::unlock_system,
};

mod amount;
mod app_database;
mod bank;
mod chains;
mod chart_database;
mod config;
mod context;
mod credit;
mod cron;
mod error;
mod exchange;
mod kv;
mod locker;
mod models;
mod notifier;
mod rollup;
mod rpc;
mod stream;
mod systems;

const LOG_TARGETS: [&str; 5] = ["server_log", "share_log", "cron_log", "bank_log", "exchange_log"];

#[derive(Parser, Debug)]
#[command(version, author, about, long_about = None)]
struct Args {
    #[arg(
        long,
        value_name = "percent",
        help = "Pool fee taken from every credited round",
        default_value = "1.0",
        global = true
    )]
    pool_fee_percent: f64,
    #[arg(
        long,
        value_name = "port",
        help = "Port of the miner event stream listener",
        default_value = "3000",
        global = true
    )]
    stream_port: u16,
    #[arg(long, action, help = "Do not run the exchange batcher")]
    disable_exchange: bool,
    #[arg(long, action, help = "Do not send payouts")]
    disable_payouts: bool,
    #[arg(long, action, help = "Do not run the chart rollups")]
    disable_rollups: bool,
    #[arg(
        long,
        value_name = "count",
        help = "Merge the UTXO set of every chain with merging enabled into <count> transactions, then exit"
    )]
    merge_utxos: Option<usize>,
}

fn log_file_layer(target: &'static str) -> (Box<dyn Layer<Registry> + Send + Sync>, WorkerGuard) {
    let name = format!("pool-{}.log", target.trim_end_matches("_log"));
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily("./logs", name));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter_fn(move |metadata| metadata.target() == target))
        .boxed();
    (layer, guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "server_log", "failed to listen for ctrl-c: {:?}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(target: "server_log", "failed to listen for SIGTERM: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_chains(path: &str) -> ChainRegistry {
    let configs = ChainConfig::load_all(Path::new(path)).expect("CHAINS_CONFIG must hold valid chain entries.");
    let chains = configs
        .into_iter()
        .map(|config| {
            let node = Arc::new(
                RpcNode::new(&config).unwrap_or_else(|e| panic!("{}: bad node configuration: {}", config.id, e)),
            );
            let mining = config.mineable.then(|| node.clone() as Arc<dyn MiningNode>);
            let payout = config.payable.then(|| node.clone() as Arc<dyn PayoutNode>);
            info!(
                target: "server_log",
                "chain {}: mineable={} payable={} switchable={}",
                config.id,
                config.mineable,
                config.payable,
                config.switchable
            );
            Chain {
                config,
                mining,
                payout,
            }
        })
        .collect();
    ChainRegistry::new(chains)
}

/// One-shot UTXO consolidation under each chain's bank lease.
async fn run_merge(ctx: &PoolContext, count: usize) {
    for chain in ctx.chains.payable().filter(|c| c.config.merge_utxos) {
        let lease = match obtain_bank_lease(ctx, chain.id()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                warn!(target: "bank_log", "{}: bank lease held elsewhere, not merging", chain.id());
                continue;
            }
            Err(e) => {
                error!(target: "bank_log", "{}: failed to obtain bank lease: {:?}", chain.id(), e);
                continue;
            }
        };
        match merge_utxos(ctx, chain, count).await {
            Ok(ids) => info!(target: "bank_log", "{}: prepared {} merge transactions", chain.id(), ids.len()),
            Err(e) => error!(target: "bank_log", "{}: merge failed: {:?}", chain.id(), e),
        }
        ctx.locker.release(lease).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut layers = Vec::with_capacity(LOG_TARGETS.len() + 1);
    let mut _guards = Vec::with_capacity(LOG_TARGETS.len());
    for target in LOG_TARGETS {
        let (layer, guard) = log_file_layer(target);
        layers.push(layer);
        _guards.push(guard);
    }
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_filter(filter_fn(|metadata| LOG_TARGETS.contains(&metadata.target())))
            .boxed(),
    );
    tracing_subscriber::registry().with(layers).init();

    let config = Config::from_env(args.pool_fee_percent);
    let chains_path = std::env::var("CHAINS_CONFIG").expect("CHAINS_CONFIG must be set.");
    let chains = Arc::new(load_chains(&chains_path));

    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKv::connect(&config.redis_url, &config.redis_read_url)
            .await
            .expect("Failed to connect to the kv store."),
    );
    let keys = Keys::new(config.environment.clone());
    let locker = Arc::new(Locker::new(kv.clone(), keys.clone()));
    let notifier = Notifier::new(config.environment.clone(), config.telegram.clone());

    info!(target: "server_log", "connecting to databases...");
    let db = Arc::new(AppDatabase::new(config.database_url.clone()));
    let read_db = Arc::new(AppDatabase::new(config.database_read_url.clone()));
    let chart_db = Arc::new(ChartDatabase::new(config.chart_database_url.clone()));
    if let Err(e) = db.ping().await {
        panic!("Failed to reach the ledger database: {:?}", e);
    }

    let exchange = match (&config.exchange, args.disable_exchange) {
        (Some(exchange), false) => {
            info!(target: "server_log", "exchange {} at {}", exchange.id, exchange.url);
            Some(Arc::new(ExchangeGateway::new(exchange).expect("Bad exchange configuration.")) as Arc<dyn Exchange>)
        }
        _ => None,
    };

    let ctx = Arc::new(PoolContext {
        db,
        read_db,
        chart_db,
        kv: kv.clone(),
        keys: keys.clone(),
        locker,
        notifier: notifier.clone(),
        chains,
        exchange,
        pool_fee_percent: config.pool_fee_percent,
    });

    if let Some(count) = args.merge_utxos {
        run_merge(&ctx, count).await;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut systems = JoinSet::new();
    systems.spawn(share_system(ctx.clone(), cancel.clone()));
    systems.spawn(unlock_system(ctx.clone(), cancel.clone()));
    systems.spawn(credit_system(ctx.clone(), cancel.clone()));
    systems.spawn(bank_system(ctx.clone(), cancel.clone()));
    systems.spawn(audit_system(ctx.clone(), cancel.clone()));
    systems.spawn(batch_system(ctx.clone(), cancel.clone()));
    if args.disable_payouts {
        info!(target: "server_log", "payouts disabled");
    } else {
        systems.spawn(payout_system(ctx.clone(), cancel.clone()));
    }
    if args.disable_rollups {
        info!(target: "server_log", "rollups disabled");
    } else {
        systems.spawn(rollup_system::block_rollup_system(ctx.clone(), cancel.clone()));
        systems.spawn(rollup_system::round_rollup_system(ctx.clone(), cancel.clone()));
        systems.spawn(rollup_system::share_rollup_system(ctx.clone(), cancel.clone()));
    }

    let fanout = StreamFanout::new(kv, keys, cancel.child_token());
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(tower_http::cors::Any);
    let app = stream::router(fanout.clone())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.stream_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "server_log", "listening on {}", listener.local_addr()?);
    notifier.info("pool server started");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_cancel.cancelled_owned())
            .await
    });

    shutdown_signal().await;
    info!(target: "server_log", "shutting down, waiting for running ticks");
    cancel.cancel();
    fanout.close_all().await;

    while let Some(result) = systems.join_next().await {
        if let Err(e) = result {
            error!(target: "server_log", "system task failed: {:?}", e);
        }
    }
    match server.await {
        Ok(Err(e)) => error!(target: "server_log", "stream server failed: {:?}", e),
        Err(e) => error!(target: "server_log", "stream server task failed: {:?}", e),
        Ok(Ok(())) => {}
    }
    info!(target: "server_log", "stopped");
    Ok(())
}
