mod config;
mod dispatch;
mod logging;
mod processor;
mod registry;
mod server;
mod session;
mod shutdown;
mod stats;
mod wire;
mod workers;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use config::AppConfig;
use dispatch::correlator::ResponseCorrelator;
use dispatch::queue::RequestQueue;
use logging::{LogLevel, Logger, LoggerConfig};
use processor::{GlossaryProcessor, Processor};
use registry::ConnectionRegistry;
use server::TcpServer;
use session::{spawn_session, SessionContext};
use shutdown::{watch_signals, Escalation, ShutdownCoordinator};
use stats::ServerStats;
use workers::{WorkerPool, WorkerPoolConfig};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);
const SESSION_READ_POLL_INTERVAL: Duration = Duration::from_millis(5);

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level = LogLevel::parse(&app_config.logging.level).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug",
            app_config.logging.level
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));

    let processor: Arc<dyn Processor> = Arc::new(GlossaryProcessor::new());
    gate_on_processor_health(processor.as_ref(), &logger);

    let registry = Arc::new(ConnectionRegistry::new());
    let queue = Arc::new(RequestQueue::new());
    let correlator = Arc::new(ResponseCorrelator::new());
    let server_stats = Arc::new(ServerStats::new());

    let pool = WorkerPool::spawn(
        WorkerPoolConfig {
            count: app_config.workers.count as usize,
            poll_interval: Duration::from_millis(app_config.workers.poll_interval_ms),
        },
        Arc::clone(&queue),
        Arc::clone(&correlator),
        Arc::clone(&processor),
        Arc::clone(&server_stats),
        Arc::clone(&logger),
    );
    logger.log(
        LogLevel::Info,
        Some("main::workers"),
        "Worker pool started",
        Some(json!({
            "count": pool.worker_count(),
            "poll_interval_ms": app_config.workers.poll_interval_ms,
        })),
    );

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for persistent TCP connections",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "max_connections": app_config.server.max_connections,
            "dispatch_timeout_ms": app_config.dispatch.timeout_ms,
            "max_frame_size_bytes": app_config.wire.max_frame_size_bytes,
        })),
    );
    logger.info(
        Some("main::server"),
        "clients speak 4-byte big-endian length-prefixed JSON frames",
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let watcher_processor = Arc::clone(&processor);
    let watcher_logger = Arc::clone(&logger);
    let _signal_watcher = watch_signals(Arc::clone(&coordinator), move |escalation| {
        match escalation {
            Escalation::BeginGraceful => {
                watcher_logger.info(
                    Some("main::shutdown"),
                    "Shutdown signal received, starting graceful shutdown",
                );
            }
            Escalation::ForceStop => {
                watcher_logger.warn(
                    Some("main::shutdown"),
                    "Second shutdown signal, releasing processor and terminating",
                );
                watcher_processor.release();
                process::exit(1);
            }
            Escalation::HardKill => process::exit(2),
        }
    })
    .unwrap_or_else(|error| {
        eprintln!("failed to install signal watcher: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Signal watcher installed for SIGINT/SIGTERM",
    );

    let session_context = Arc::new(SessionContext {
        registry: Arc::clone(&registry),
        queue: Arc::clone(&queue),
        correlator,
        processor: Arc::clone(&processor),
        stats: server_stats,
        logger: Arc::clone(&logger),
        shutdown: Arc::clone(&coordinator),
        dispatch_timeout: Duration::from_millis(app_config.dispatch.timeout_ms),
        poll_interval: SESSION_READ_POLL_INTERVAL,
        max_frame_size: app_config.wire.max_frame_size_bytes as usize,
    });

    while !coordinator.stop_requested() {
        let accepted = server.try_accept_persistent().unwrap_or_else(|error| {
            eprintln!("server accept error: {error}");
            process::exit(2);
        });

        match accepted {
            Some(connection) if registry.count() >= app_config.server.max_connections as usize => {
                logger.warn(
                    Some("main::server"),
                    &format!(
                        "rejecting connection from {}: connection limit {} reached",
                        connection.peer_addr(),
                        app_config.server.max_connections
                    ),
                );
                let _ = connection.shutdown();
            }
            Some(connection) => {
                spawn_session(Arc::clone(&session_context), connection);
            }
            None => thread::sleep(ACCEPT_POLL_INTERVAL),
        }
    }

    let closed = registry.shutdown_all();
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Stopped accepting, closing client connections",
        Some(json!({"closed_connections": closed})),
    );

    let grace = Duration::from_millis(app_config.dispatch.shutdown_grace_ms);
    let deadline = Instant::now() + grace;
    while !queue.is_empty() && Instant::now() < deadline {
        thread::sleep(DRAIN_POLL_INTERVAL);
    }
    if queue.is_empty() {
        logger.info(Some("main::shutdown"), "Request queue drained");
    } else {
        logger.warn(
            Some("main::shutdown"),
            &format!("Drain grace period elapsed with {} queued jobs", queue.len()),
        );
    }

    pool.request_stop();
    let stragglers = pool.join_with_timeout(grace);
    if stragglers > 0 {
        logger.warn(
            Some("main::shutdown"),
            &format!("{stragglers} workers still busy after the grace period; continuing shutdown"),
        );
    }
    processor.release();
    coordinator.mark_terminated();
    logger.info(Some("main::shutdown"), "Shutdown completed");
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn gate_on_processor_health(processor: &dyn Processor, logger: &Logger) {
    let report = processor.health_report();
    if report["healthy"] != serde_json::Value::Bool(true) {
        eprintln!("processor failed its startup health check: {report}");
        process::exit(2);
    }

    logger.log(
        LogLevel::Info,
        Some("main::processor"),
        "Processor passed startup health check",
        Some(report),
    );
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: yakusu is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;110m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
             _
 _   _  __ _| | ___   _ ___ _   _
| | | |/ _` | |/ / | | / __| | | |
| |_| | (_| |   <| |_| \__ \ |_| |
 \__, |\__,_|_|\_\\__,_|___/\__,_|
 |___/                            "#;
    const APP_DESCRIPTION: &str =
        "Concurrent translation dispatch engine over persistent full-duplex TCP.";
    const REPO_URL: &str = "https://github.com/mwognicki/yakusu";
    const COPYRIGHT_NOTICE: &str = "Copyright (c) 2026 Marek Kapusta-Ognicki";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("YAKUSU_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("Repository: {REPO_URL}");
    println!("{DIM_GRAY}{COPYRIGHT_NOTICE}{RESET}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
