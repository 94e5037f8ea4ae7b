// notifyd: service entry point. Loads configuration from the environment,
// wires the container, subscribes the topic consumers and runs until
// interrupted.
//
// Exit codes: 0 normal shutdown, 1 configuration error, 2 dependency
// unavailable at startup, 64 fatal invariant violation.

use trade_notify::services::core::ingest::consumers::InMemoryTopic;
use trade_notify::utils::{ErrorKind, NotifyError};
use trade_notify::{ServiceConfig, ServiceContainer};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;
const EXIT_INVARIANT: i32 = 64;

const UPSTREAM_TOPICS: &[&str] = &[
    "trading-events",
    "user-profile-events",
    "payment-events",
    "security-events",
    "portfolio-events",
    "trading.notifications",
];

fn exit_code_for(err: &NotifyError) -> i32 {
    match err.kind {
        ErrorKind::ConfigError | ErrorKind::MissingConfig | ErrorKind::ValidationError => {
            EXIT_CONFIG
        }
        ErrorKind::ServiceUnavailable | ErrorKind::Storage | ErrorKind::AdapterTransient => {
            EXIT_DEPENDENCY
        }
        ErrorKind::InvalidTransition | ErrorKind::Internal => EXIT_INVARIANT,
        _ => EXIT_DEPENDENCY,
    }
}

async fn run() -> Result<(), (i32, NotifyError)> {
    let config = ServiceConfig::from_env().map_err(|e| (EXIT_CONFIG, e))?;

    let mut container = ServiceContainer::start(config)
        .await
        .map_err(|e| (exit_code_for(&e), e))?;

    // The broker client binds here; the in-memory topics stand in until the
    // transport layer hands over real subscriptions. Producer handles stay
    // alive for the process lifetime so the consumers keep polling.
    let mut producers = Vec::new();
    for topic in UPSTREAM_TOPICS {
        let (producer, source) = InMemoryTopic::channel(*topic, 256);
        container.attach_ingestor(Box::new(source));
        producers.push(producer);
    }
    let (dlq_producer, dlq_source) = InMemoryTopic::channel("notifications.dlq", 256);
    container.attach_dead_letter(Box::new(dlq_source), None);
    producers.push(dlq_producer);

    log::info!("notifyd running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| (EXIT_DEPENDENCY, NotifyError::internal_error(e.to_string())))?;

    log::info!("shutdown signal received; draining in-flight dispatches");
    container.shutdown().await;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(EXIT_DEPENDENCY);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => std::process::exit(EXIT_OK),
        Err((code, err)) => {
            log::error!("notifyd exiting with code {}: {}", code, err);
            std::process::exit(code);
        }
    }
}
