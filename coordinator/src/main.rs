//! Paycore Coordinator Binary
//!
//! Runs a single coordinator instance with an in-memory ledger, registering
//! the validation nodes listed in `CLUSTER_NODES`.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paycore_common::{AccountId, Currency, NodeId};
use paycore_coordinator::{
    Coordinator, CoordinatorConfig, InMemoryEventPublisher, InMemoryTransactionStore,
    NodeValidator, NoopFraudCheck, RingNode,
};
use paycore_ledger::{Account, InMemoryLedger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Paycore Coordinator");

    // Load configuration
    let config = CoordinatorConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let ledger = Arc::new(InMemoryLedger::new());
    seed_demo_accounts(&ledger);

    let coordinator = Arc::new(Coordinator::new(
        config,
        ledger.clone(),
        Arc::new(InMemoryTransactionStore::new()),
        Arc::new(InMemoryEventPublisher::new()),
    ));

    // Register validation nodes from the environment, one per cluster member.
    let cluster = std::env::var("CLUSTER_NODES")
        .unwrap_or_else(|_| "node1,node2,node3".to_string());
    for name in cluster.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let node_id = NodeId::new(name);
        coordinator.register_node(
            RingNode::new(node_id.clone(), 100),
            Arc::new(NodeValidator::new(
                node_id,
                ledger.clone(),
                Arc::new(NoopFraudCheck),
            )),
        );
    }
    info!(
        nodes = coordinator.healthy_node_count(),
        "Validation nodes registered"
    );

    // Set up graceful shutdown
    let coordinator_clone = coordinator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Shutdown signal received");
        if let Err(e) = coordinator_clone.stop().await {
            error!(error = %e, "Error during shutdown");
        }
    });

    // Start coordinator
    coordinator.start().await?;
    info!("Coordinator running");

    // Keep running until shutdown
    loop {
        if !coordinator.state().accepts_requests() {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    info!("Coordinator shutdown complete");
    Ok(())
}

fn seed_demo_accounts(ledger: &InMemoryLedger) {
    for (id, balance) in [("ACC_ALICE", 1000), ("ACC_BOB", 500), ("ACC_CAROL", 250)] {
        ledger.open_account(
            Account::new(AccountId::new(id), Currency::usd()),
            Decimal::from(balance),
        );
    }
}
