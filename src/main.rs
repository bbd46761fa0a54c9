mod cluster;
mod config;
mod events;
mod heartbeat;
mod logging;
mod orchestrator;
mod pools;
mod server;
mod shutdown;
mod timer;
mod utils;
mod wire;
mod worker;

use std::process;

use cluster::{ClusterContext, StaticVoting, VoteData};
use config::AppConfig;
use logging::{LogLevel, Logger, LoggerConfig};
use orchestrator::dispatcher::QueueProcessor;
use orchestrator::queues::{SyncOperation, SyncQueueData};
use serde_json::json;
use shutdown::ShutdownHooks;
use utils::runtime::ensure_posix_or_exit;
use utils::startup_banner::print_startup_banner;
use worker::{Worker, WorkerSettings};

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let app_config = load_config_or_exit(&args);
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, trace",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });

    let self_identity = VoteData::from(&app_config.node);
    let context = ClusterContext::new(self_identity.clone());
    let voting = StaticVoting::new(self_identity);
    context.apply_vote(voting.elect(&app_config.cluster));
    log_leader_decision(&logger, &context, "Initial leader decision applied");

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install signal hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Signal hooks installed for SIGINT/SIGTERM (shutdown) and SIGHUP (cluster reload)",
    );

    let mut worker = Worker::initialize(
        WorkerSettings::from(&app_config),
        context.clone(),
        Box::new(QueueProcessor::new()),
        logger.clone(),
    )
    .unwrap_or_else(|error| {
        eprintln!("worker initialization error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::worker"),
        &format!(
            "{} v{} worker started",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "node_id": worker.node_id(),
            "tcp_address": worker.local_addr().map(|addr| addr.to_string()).ok(),
            "udp_address": worker.udp_local_addr().map(|addr| addr.to_string()).ok(),
        })),
    );
    for name in &app_config.queues.declared {
        if let Err(error) =
            worker.notify_sync_request(&SyncQueueData::new(name.as_str(), SyncOperation::Declare))
        {
            logger.warn(
                Some("main::queues"),
                &format!("cannot declare queue {name}: {error}"),
            );
        }
    }

    let mut exit_code = 0;
    while !shutdown_hooks.is_triggered() {
        if shutdown_hooks.take_reload_request() {
            reload_cluster(&args, &voting, &context, &worker, &logger);
        }
        if let Err(error) = worker.run_once() {
            logger.error(Some("main::worker"), &format!("worker loop failed: {error}"));
            exit_code = 2;
            break;
        }
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown started, tearing down worker",
    );
    worker.teardown();
    logger.info(Some("main::shutdown"), "Shutdown completed");

    if exit_code != 0 {
        process::exit(exit_code);
    }
}

fn load_config_or_exit(args: &[String]) -> AppConfig {
    match AppConfig::load_with_discovery(args.iter().cloned()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

/// Re-reads the `[cluster]` table and hands the new decision to the worker.
fn reload_cluster(
    args: &[String],
    voting: &StaticVoting,
    context: &ClusterContext,
    worker: &Worker,
    logger: &Logger,
) {
    let config = match AppConfig::load_with_discovery(args.iter().cloned()) {
        Ok(config) => config,
        Err(error) => {
            logger.warn(
                Some("main::cluster"),
                &format!("cluster reload skipped, configuration error: {error}"),
            );
            return;
        }
    };

    context.apply_vote(voting.elect(&config.cluster));
    log_leader_decision(logger, context, "Cluster table reloaded");
    if let Err(error) = worker.notify_leader_change() {
        logger.warn(
            Some("main::cluster"),
            &format!("failed to notify worker about leader change: {error}"),
        );
    }
}

fn log_leader_decision(logger: &Logger, context: &ClusterContext, message: &str) {
    let leader = context.leader_identity();
    logger.log(
        LogLevel::Info,
        Some("main::cluster"),
        message,
        Some(json!({
            "self": context.self_identity(),
            "leader": leader,
            "is_leader": context.is_leader(),
            "term": context.term(),
        })),
    );
}
