//! ppd — storage peer daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use pp_core::config::PpConfig;
use pp_services::{
    serve, ConnectionRegistry, EventDispatcher, FileRpc, HandlerRegistry, Scheduler, SpIdentity,
    SpManager, TcpConnector,
};

mod handlers;

use handlers::{NodeContext, NodeState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PpConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PpConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PpConfig::default()
    });
    tracing::info!(
        p2p_address = %config.identity.p2p_address,
        sp_count = config.network.sp_list.len(),
        app_ver = config.version.app_ver,
        "ppd starting"
    );
    if config.network.sp_list.is_empty() {
        tracing::warn!("no bootstrap SPs configured");
    }

    // Shared state
    let file_rpc = Arc::new(FileRpc::new(config.timing.rpc_wait_timeout()));
    let dispatcher = Arc::new(EventDispatcher::new());
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(TcpConnector::new(
        dispatcher.clone(),
        config.version.app_ver,
        config.network.connect_timeout(),
    ))));
    let identity = SpIdentity {
        p2p_address: config.identity.p2p_address.clone(),
        p2p_public_key: config.identity.p2p_public_key.clone(),
        wallet_address: config.identity.wallet_address.clone(),
    };
    let sp = Arc::new(SpManager::new(identity, registry.clone(), &config.network.sp_list));
    let node = Arc::new(NodeState::default());

    // Dispatch table
    {
        let mut handler_registry = HandlerRegistry::new();
        handlers::register(
            &mut handler_registry,
            NodeContext {
                p2p_address: config.identity.p2p_address.clone(),
                sp: sp.clone(),
                registry: registry.clone(),
                file_rpc: file_rpc.clone(),
                node: node.clone(),
            },
        );
        dispatcher
            .install(handler_registry)
            .context("failed to install dispatch table")?;
    }

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

    let listener_task = if config.network.listen_address.is_empty() {
        None
    } else {
        let listener = TcpListener::bind(&config.network.listen_address)
            .await
            .with_context(|| format!("failed to bind {}", config.network.listen_address))?;
        Some(tokio::spawn(serve(
            listener,
            dispatcher.clone(),
            config.version.app_ver,
            shutdown_tx.subscribe(),
        )))
    };

    // Initial contact: connect, learn the SP list, report in.
    {
        let sp = sp.clone();
        tokio::spawn(async move {
            if let Err(e) = sp.refresh_sp_list().await {
                tracing::warn!(error = %e, "initial SP list request failed");
                return;
            }
            if let Err(e) = sp.get_pp_status(false).await {
                tracing::warn!(error = %e, "initial PP status request failed");
            }
        });
    }

    let scheduler = Scheduler::new();
    {
        let sp = sp.clone();
        scheduler.add_repeating("sp_list_reload", config.timing.sp_list_reload(), move || {
            let sp = sp.clone();
            async move {
                if let Err(e) = sp.refresh_sp_list().await {
                    tracing::warn!(error = %e, "SP list reload failed");
                }
            }
        });
    }
    {
        let sp = sp.clone();
        scheduler.add_repeating("latency_sweep", config.timing.latency_check(), move || {
            handlers::sweep_and_select(sp.clone())
        });
    }
    {
        let sp = sp.clone();
        scheduler.add_repeating("pp_status", config.timing.pp_status(), move || {
            let sp = sp.clone();
            async move {
                if let Err(e) = sp.get_pp_status(true).await {
                    tracing::warn!(error = %e, "PP status request failed");
                }
            }
        });
    }

    let status_printer = {
        let sp = sp.clone();
        let node = node.clone();
        let file_rpc = file_rpc.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(
                    active_sp = sp.active_addr().as_deref().unwrap_or("-"),
                    is_pp = node.is_pp(),
                    synced = node.synced_with_sp(),
                    peer_connections = registry.len(),
                    pending_chunks = file_rpc.upload_data().len(),
                    pending_events = file_rpc.file_events().len(),
                    "node snapshot"
                );
                for peer in sp.peers() {
                    tracing::info!(
                        addr = %peer.network_address,
                        status = ?peer.status,
                        latency_ms = peer.latency.map(|l| l.as_millis() as u64),
                        failures = peer.failures,
                        "  sp"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let listener_done = async {
        match listener_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = listener_done      => tracing::error!("peer listener exited: {:?}", r),
        r = status_printer     => tracing::error!("status printer exited: {:?}", r),
    }

    scheduler.stop();
    if let Some(conn) = sp.active() {
        conn.close();
    }
    Ok(())
}
