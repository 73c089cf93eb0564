//! refuncd — local refunc daemon: bus, broker, gateway and worker agents in
//! one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use refunc_broker::{Broker, LocalOperator};
use refunc_client::{InvocationContext, LocalBus, MessageBus};
use refunc_core::config::RefuncConfig;
use refunc_gateway::GatewayState;
use refuncd::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = RefuncConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RefuncConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RefuncConfig::default()
    });

    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u16>().with_context(|| format!("invalid port: {arg}"))?,
        None => config.gateway.port,
    };
    tracing::info!(
        port,
        namespace = %config.broker.namespace,
        functions = config.functions.len(),
        "refuncd starting"
    );

    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let operator = LocalOperator::from_config(&config.broker.namespace, &config.functions);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let broker_task = Broker::new(bus.clone(), Arc::new(operator.clone()), config.broker.clone())
        .spawn(shutdown_tx.subscribe())
        .await
        .context("failed to start broker")?;

    let mut agent_tasks = Vec::new();
    for function in &config.functions {
        if function.command.is_empty() {
            tracing::warn!(
                namespace = %function.namespace,
                name = %function.name,
                "function has no command, not starting an agent"
            );
            continue;
        }
        let task = Agent::new(bus.clone(), operator.clone(), function)
            .spawn(shutdown_tx.subscribe())
            .await
            .with_context(|| format!("failed to start agent for {}/{}", function.namespace, function.name))?;
        agent_tasks.push(task);
    }

    let gateway_task = {
        let state = GatewayState::new(InvocationContext::new().with_bus(bus.clone()));
        tokio::spawn(async move {
            if let Err(e) = refunc_gateway::serve(state, port).await {
                tracing::error!(error = %e, "gateway failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = broker_task        => tracing::error!("broker exited: {:?}", r),
        r = gateway_task       => tracing::error!("gateway exited: {:?}", r),
    }

    // Agents close their pooled workers on the way out.
    let _ = shutdown_tx.send(());
    let drained = join_agents(agent_tasks);
    if tokio::time::timeout(Duration::from_secs(5), drained).await.is_err() {
        tracing::warn!("agents did not stop in time");
    }

    Ok(())
}

async fn join_agents(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "agent task failed");
        }
    }
}
