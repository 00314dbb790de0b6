use std::sync::Arc;

use anyhow::Result;
use blob_store::BlobStorage;
use cache::CacheLayer;
use data_model::{PendingAssetJob, ThumbnailSet, ThumbnailSize, VaultFile};
use sha2::{Digest, Sha256};
use state_store::{
    requests::{
        AttachThumbnailsRequest, RemovePendingAssetRequest, RequestPayload,
        SetSecondaryChecksumRequest, UpdatePendingAssetAttemptsRequest, VaultUpdateRequest,
    },
    FileVaultState,
};
use tracing::{error, info};

use crate::{listing, sniff};

/// Attempts per job before it is dropped; the upload itself has already
/// succeeded, so exhausted jobs only leave thumbnails unset.
pub const MAX_ASSET_ATTEMPTS: u32 = 5;

const BATCH_SIZE: usize = 10;

/// Produces thumbnail variant bytes from an image payload. The encoding
/// strategy is pluggable; the worker only cares about bytes in, bytes out.
pub trait ThumbnailGenerator: Send + Sync {
    fn generate(&self, image: &[u8], size: ThumbnailSize) -> Result<Vec<u8>>;
}

/// Stores the source bytes for every variant. Stands in until an image
/// codec backend is mounted behind the trait.
pub struct PassthroughThumbnailGenerator;

impl ThumbnailGenerator for PassthroughThumbnailGenerator {
    fn generate(&self, image: &[u8], _size: ThumbnailSize) -> Result<Vec<u8>> {
        Ok(image.to_vec())
    }
}

/// Background worker draining the pending-asset queue: thumbnail variants
/// for images and the secondary SHA-256 checksum for everything. Wakes on
/// the state store's watch channel, retries failures with a bounded
/// attempt count, and never affects the originating upload.
pub struct AssetWorker {
    state: Arc<FileVaultState>,
    storage: Arc<BlobStorage>,
    cache: Arc<CacheLayer>,
    generator: Arc<dyn ThumbnailGenerator>,
    rx: tokio::sync::watch::Receiver<()>,
    shutdown_rx: tokio::sync::watch::Receiver<()>,
}

impl AssetWorker {
    pub fn new(
        state: Arc<FileVaultState>,
        storage: Arc<BlobStorage>,
        cache: Arc<CacheLayer>,
        generator: Arc<dyn ThumbnailGenerator>,
        shutdown_rx: tokio::sync::watch::Receiver<()>,
    ) -> Self {
        let rx = state.get_asset_watcher();
        Self {
            state,
            storage,
            cache,
            generator,
            rx,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        loop {
            if self.shutdown_rx.has_changed().unwrap_or(false) {
                info!("asset worker shutting down");
                return Ok(());
            }
            let processed = self.process_pending().await?;
            if processed == 0 {
                let remaining = self.state.reader().list_pending_assets(1)?;
                if remaining.is_empty() {
                    tokio::select! {
                        _ = self.rx.changed() => { self.rx.borrow_and_update(); }
                        _ = self.shutdown_rx.changed() => {
                            info!("asset worker shutting down");
                            return Ok(());
                        }
                    }
                } else {
                    // only failing jobs left; back off before retrying
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Drains one batch of pending jobs. Returns the number of jobs
    /// resolved (completed or dropped), which is what the loop uses to
    /// decide between sleeping and backing off.
    pub async fn process_pending(&self) -> Result<usize> {
        let jobs = self.state.reader().list_pending_assets(BATCH_SIZE)?;
        let mut resolved = 0;
        for job in jobs {
            match self.process_job(&job).await {
                Ok(()) => {
                    self.state.write(VaultUpdateRequest {
                        payload: RequestPayload::RemovePendingAsset(RemovePendingAssetRequest {
                            file_key: job.file_key.clone(),
                        }),
                    })?;
                    resolved += 1;
                }
                Err(e) => {
                    let attempts = job.attempts + 1;
                    if attempts >= MAX_ASSET_ATTEMPTS {
                        error!(
                            file_key = %job.file_key,
                            attempts,
                            "dropping asset job after repeated failures: {:?}",
                            e
                        );
                        self.state.write(VaultUpdateRequest {
                            payload: RequestPayload::RemovePendingAsset(
                                RemovePendingAssetRequest {
                                    file_key: job.file_key.clone(),
                                },
                            ),
                        })?;
                        resolved += 1;
                    } else {
                        error!(
                            file_key = %job.file_key,
                            attempts,
                            "asset job failed, will retry: {:?}",
                            e
                        );
                        self.state.write(VaultUpdateRequest {
                            payload: RequestPayload::UpdatePendingAssetAttempts(
                                UpdatePendingAssetAttemptsRequest {
                                    file_key: job.file_key.clone(),
                                    attempts,
                                },
                            ),
                        })?;
                    }
                }
            }
        }
        Ok(resolved)
    }

    async fn process_job(&self, job: &PendingAssetJob) -> Result<()> {
        let Some(file) = self.state.reader().get_file_by_key(&job.file_key)? else {
            // record purged since the job was enqueued
            return Ok(());
        };
        if file.deleted_at.is_some() {
            return Ok(());
        }
        let bytes = self.storage.read_bytes(&file.storage_key).await?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let checksum_sha256 = format!("{:x}", hasher.finalize());
        self.state.write(VaultUpdateRequest {
            payload: RequestPayload::SetSecondaryChecksum(SetSecondaryChecksumRequest {
                file_key: job.file_key.clone(),
                checksum_sha256,
            }),
        })?;

        if job.generate_thumbnails && file.is_image() {
            let thumbnails = self.generate_thumbnails(&file, &bytes).await?;
            let dimensions = sniff::dimensions(&bytes);
            self.state.write(VaultUpdateRequest {
                payload: RequestPayload::AttachThumbnails(AttachThumbnailsRequest {
                    file_key: job.file_key.clone(),
                    thumbnails,
                    width: file.width.or(dimensions.map(|d| d.width)),
                    height: file.height.or(dimensions.map(|d| d.height)),
                }),
            })?;
        }
        // the cached copy of the record predates the writes above
        listing::invalidate_file(&self.cache, &file.vault_id, &file.id).await;
        Ok(())
    }

    /// Variant keys are deterministic per file, so a retried job
    /// overwrites its own partial output instead of leaking blobs.
    async fn generate_thumbnails(&self, file: &VaultFile, bytes: &[u8]) -> Result<ThumbnailSet> {
        let mut thumbnails = ThumbnailSet::default();
        for size in ThumbnailSize::all() {
            let variant = self.generator.generate(bytes, size)?;
            let key = file.thumbnail_key(size);
            self.storage.put_bytes_at(&key, variant.into()).await?;
            match size {
                ThumbnailSize::Small => thumbnails.small = Some(key),
                ThumbnailSize::Medium => thumbnails.medium = Some(key),
                ThumbnailSize::Large => thumbnails.large = Some(key),
            }
        }
        Ok(thumbnails)
    }
}
