use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::{BlobStorage, LocalUrlSigner};
use cache::{CacheLayer, InMemorySharedCache};
use metrics::vault_stats;
use state_store::FileVaultState;
use tokio::{
    self, signal,
    sync::{watch, Mutex},
};
use tracing::info;

use crate::{
    assets::{AssetWorker, PassthroughThumbnailGenerator},
    config::ServerConfig,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: Arc<ServerConfig>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_storage: Arc<BlobStorage>,
    pub state: Arc<FileVaultState>,
    pub cache: Arc<CacheLayer>,
    pub asset_worker: Arc<Mutex<AssetWorker>>,
    pub metrics: Arc<vault_stats::Metrics>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );
        let state = FileVaultState::new(config.state_store_path.parse()?)?;
        let cache = Arc::new(CacheLayer::new(
            config.cache.to_cache_config(),
            Some(Arc::new(InMemorySharedCache::new())),
        ));
        let asset_worker = Arc::new(Mutex::new(AssetWorker::new(
            state.clone(),
            blob_storage.clone(),
            cache.clone(),
            Arc::new(PassthroughThumbnailGenerator),
            shutdown_rx.clone(),
        )));

        Ok(Self {
            config: Arc::new(config),
            shutdown_tx,
            shutdown_rx,
            blob_storage,
            state,
            cache,
            asset_worker,
            metrics: Arc::new(vault_stats::Metrics::new()),
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let asset_worker = self.asset_worker.clone();
        tokio::spawn(async move {
            let mut asset_worker_guard = asset_worker.lock().await;
            if let Err(e) = asset_worker_guard.start().await {
                tracing::error!("asset worker exited with error: {:?}", e);
            }
        });

        let route_state = RouteState {
            config: self.config.clone(),
            state: self.state.clone(),
            blob_storage: self.blob_storage.clone(),
            cache: self.cache.clone(),
            local_signer: LocalUrlSigner::new(
                &self.config.api_base_url,
                &self.config.url_signing_secret,
            ),
            metrics: self.metrics.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    shutdown_tx.send(()).unwrap();
    info!("signal received, shutting down server gracefully");
}
