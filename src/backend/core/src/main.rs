//! Chronicle Server - Main entry point
//!
//! Wires the event store, bus, audit collector and notification forwarder
//! together and runs until a shutdown signal arrives.

use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use chronicle_core::{
    audit::{AuditCollector, InMemoryAuditRepository, InMemoryNotificationSink, NotificationForwarder},
    config::Config,
    events::{AggregateRoot, CausalEvent, Causation, EventBus, EventIdGenerator, EventStore, InMemoryEventStore, TaskAggregate},
    telemetry,
};

#[derive(Parser)]
#[command(
    name = "chronicle-server",
    version,
    about = "Chronicle - causal event log and audit pipeline",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CHRONICLE_CONFIG")]
    config: Option<String>,

    /// Publish a short sample event stream after startup
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    let telemetry = telemetry::init_telemetry(
        &config.telemetry,
        &config.service.name,
        &config.service.environment,
    )?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.service.environment,
        "Starting Chronicle Server"
    );

    let bus = EventBus::new();
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let audit_repository = Arc::new(InMemoryAuditRepository::new());
    let notification_sink = Arc::new(InMemoryNotificationSink::new());

    let forwarder = NotificationForwarder::attach(&bus, notification_sink.clone());
    let collector = AuditCollector::new(config.collector.clone(), bus.clone(), audit_repository.clone());
    collector.start()?;

    if cli.demo {
        run_demo(store.as_ref(), &bus).await?;
    }

    shutdown_signal().await;

    let report = collector.shutdown().await;
    forwarder.unsubscribe();

    let stats = serde_json::to_string(&collector.stats())?;
    tracing::info!(
        final_flush = report.persisted,
        stats = %stats,
        audit_records = audit_repository.len(),
        notifications = notification_sink.len(),
        "Audit pipeline drained"
    );

    telemetry.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Record a task lifecycle and a failed login, committing and publishing each event.
async fn run_demo(store: &dyn EventStore, bus: &EventBus) -> anyhow::Result<()> {
    let ids = EventIdGenerator::new();
    let mut task = AggregateRoot::<TaskAggregate>::new("task-1");

    task.record(
        &ids,
        "demo",
        "work",
        "TaskCreated",
        json!({"title": "Inspect site", "status": "TODO", "priority": "high"}),
        Causation::new("maria", "createTask"),
    )?;
    task.record(
        &ids,
        "demo",
        "work",
        "TaskAssigned",
        json!({"assignee": "dev-1"}),
        Causation::new("maria", "assignTask"),
    )?;
    task.record(
        &ids,
        "demo",
        "work",
        "TaskStatusChanged",
        json!({"from": "TODO", "to": "IN_PROGRESS"}),
        Causation::new("dev-1", "startTask"),
    )?;

    let pending = task.uncommitted_events().to_vec();
    task.commit(store).await?;
    bus.publish_batch(&pending).await;

    let login_id = ids.generate_event_id("demo", "auth", "session", None)?;
    let failed_login = CausalEvent::builder(login_id, "session-1", "session", "auth.login")
        .payload(json!({"metadata": {"result": "failure", "ip": "203.0.113.7"}}))
        .causation(Causation::new("maria", "login"))
        .build();
    bus.publish(&failed_login).await;

    tracing::info!(
        task_version = task.version(),
        status = ?task.state().status,
        "Demo events published"
    );
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
