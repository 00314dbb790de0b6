use anyhow::Result;
use blob_store::{BlobStorageConfig, LocalUrlSigner};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, routes::RouteState, service::Service};

pub struct TestService {
    pub service: Service,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;

        let cfg = ServerConfig {
            state_store_path: temp_dir
                .path()
                .join("state_store")
                .to_str()
                .unwrap()
                .to_string(),
            blob_storage: BlobStorageConfig::new(
                temp_dir.path().join("blob_store").to_str().unwrap(),
            ),
            ..Default::default()
        };
        let srv = Service::new(cfg).await?;

        Ok(Self {
            service: srv,
            _temp_dir: temp_dir,
        })
    }

    /// Drains the pending-asset queue once, the way the background worker
    /// loop would.
    pub async fn process_assets(&self) -> Result<usize> {
        let worker = self.service.asset_worker.lock().await;
        worker.process_pending().await
    }

    /// Handler-level state, for exercising route helpers without binding
    /// a listener.
    pub fn route_state(&self) -> RouteState {
        RouteState {
            config: self.service.config.clone(),
            state: self.service.state.clone(),
            blob_storage: self.service.blob_storage.clone(),
            cache: self.service.cache.clone(),
            local_signer: LocalUrlSigner::new(
                &self.service.config.api_base_url,
                &self.service.config.url_signing_secret,
            ),
            metrics: self.service.metrics.clone(),
        }
    }
}
