use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use apisix_sync::admin::{setup_admin_router, AdminState};
use apisix_sync::config::{load_config, DesiredStateWatcher, StoreBackend, SyncConfig};
use apisix_sync::lifecycle::signals::wait_for_signal;
use apisix_sync::lifecycle::Shutdown;
use apisix_sync::observability::{logging, metrics};
use apisix_sync::store::{
    ApisixConfigStore, EtcdKvStore, FileConfigStore, KvConfigStore, MemoryKvStore,
};
use apisix_sync::synchronizer::{ApisixConfigSynchronizer, VirtualStage};

#[derive(Parser)]
#[command(name = "apisix-sync")]
#[command(about = "Synchronize per-stage gateway configuration into APISIX", long_about = None)]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => SyncConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.store.backend,
        flush_interval_secs = config.synchronizer.flush_interval_secs,
        "apisix-sync starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Arc::new(Shutdown::new());

    let store: Arc<dyn ApisixConfigStore> = match config.store.backend {
        StoreBackend::Etcd => {
            let client =
                Arc::new(EtcdKvStore::connect(&config.store.endpoints, config.store.connect_timeout()).await?);
            Arc::new(KvConfigStore::new(client, config.store.kv_settings(), &shutdown).await?)
        }
        StoreBackend::Memory => {
            tracing::warn!("Memory backend selected, configuration stays inside this process");
            let client = Arc::new(MemoryKvStore::new());
            Arc::new(KvConfigStore::new(client, config.store.kv_settings(), &shutdown).await?)
        }
        StoreBackend::File => Arc::new(FileConfigStore::open(&config.store.file_path).await?),
    };

    let synchronizer =
        ApisixConfigSynchronizer::new(store, VirtualStage::from(&config.virtual_stage));
    let flush_loop =
        synchronizer.spawn_flush_loop(config.synchronizer.flush_interval(), shutdown.subscribe());

    // Dropping the watcher stops file notifications, so it lives until exit.
    let _desired_state_watcher = match &config.source.desired_state_path {
        Some(path) => {
            let (watcher, mut updates) = DesiredStateWatcher::new(path);
            watcher.send_current();
            let notify_watcher = watcher.run()?;

            let synchronizer = synchronizer.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(state) = updates.recv() => {
                            tracing::info!(stages = state.len(), "Applying desired state");
                            if let Err(e) = synchronizer.apply_desired_state(state).await {
                                tracing::warn!(error = %e, "Stale stage removal incomplete");
                            }
                        }
                        _ = stop.recv() => break,
                    }
                }
            });
            Some(notify_watcher)
        }
        None => {
            tracing::info!("No desired state path configured, waiting for admin requests only");
            None
        }
    };

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");

        let router = setup_admin_router(AdminState::new(synchronizer.clone(), &config.admin.api_key));
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "Admin server failed");
            }
        });
    }

    wait_for_signal().await;
    shutdown.trigger();

    if let Some(flush_loop) = flush_loop {
        if let Err(e) = flush_loop.await {
            tracing::error!(error = %e, "Flush loop aborted");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
