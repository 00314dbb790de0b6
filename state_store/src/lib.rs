pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use data_model::{
    FileId, Share, ShareAccess, ShareBuilder, VaultError, VaultFile, VaultId,
};
use requests::{
    CreateFileRequest, CreateShareRequest, PurgeResult, RequestPayload, VaultUpdateRequest,
};
use rocksdb::{ColumnFamilyDescriptor, Options, TransactionDB, TransactionDBOptions};
use scanner::VaultReader;
use state_machine::VaultObjectsColumns;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tracing::{debug, info};

/// Attempts at minting an unused share short code before giving up.
pub const MAX_SHORT_CODE_ATTEMPTS: usize = 5;

pub struct FileVaultState {
    pub db: Arc<TransactionDB>,
    pub state_store_path: PathBuf,
    asset_tx: watch::Sender<()>,
    asset_rx: watch::Receiver<()>,
}

impl FileVaultState {
    pub fn new(path: PathBuf) -> Result<Arc<Self>> {
        let column_families: Vec<ColumnFamilyDescriptor> = VaultObjectsColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()))
            .collect();
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db: TransactionDB = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            path.clone(),
            column_families,
        )
        .context("failed to open state store db")?;
        let (asset_tx, asset_rx) = watch::channel(());
        info!("opened state store at {:?}", path);
        Ok(Arc::new(Self {
            db: Arc::new(db),
            state_store_path: path,
            asset_tx,
            asset_rx,
        }))
    }

    pub fn reader(&self) -> VaultReader {
        VaultReader::new(self.db.clone())
    }

    /// Watch channel the asset worker sleeps on; notified whenever new
    /// background work is enqueued.
    pub fn get_asset_watcher(&self) -> watch::Receiver<()> {
        self.asset_rx.clone()
    }

    /// Single entry point for updates that cannot fail with a domain
    /// error. Each request commits in its own transaction.
    pub fn write(&self, request: VaultUpdateRequest) -> Result<(), VaultError> {
        debug!("writing state update: {}", request.payload);
        let txn = self.db.transaction();
        match &request.payload {
            RequestPayload::CreateVault(vault) => {
                state_machine::create_vault(self.db.clone(), &txn, vault)?;
            }
            RequestPayload::CreateFolder(folder) => {
                state_machine::create_folder(self.db.clone(), &txn, folder)?;
            }
            RequestPayload::AttachThumbnails(req) => {
                state_machine::attach_thumbnails(
                    self.db.clone(),
                    &txn,
                    &req.file_key,
                    &req.thumbnails,
                    req.width,
                    req.height,
                )?;
            }
            RequestPayload::SetSecondaryChecksum(req) => {
                state_machine::set_secondary_checksum(
                    self.db.clone(),
                    &txn,
                    &req.file_key,
                    &req.checksum_sha256,
                )?;
            }
            RequestPayload::UpdatePendingAssetAttempts(req) => {
                state_machine::update_pending_asset_attempts(
                    self.db.clone(),
                    &txn,
                    &req.file_key,
                    req.attempts,
                )?;
            }
            RequestPayload::RemovePendingAsset(req) => {
                state_machine::remove_pending_asset(self.db.clone(), &txn, &req.file_key)?;
            }
            RequestPayload::DeactivateShare(req) => {
                state_machine::deactivate_share(self.db.clone(), &txn, &req.vault_id, &req.share_id)?;
            }
            RequestPayload::Noop => {}
        }
        txn.commit()
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        Ok(())
    }

    /// Commits an upload and wakes the asset worker. Dedup, quota and
    /// the usage increment are atomic; see `state_machine::create_file`.
    pub fn create_file(&self, request: CreateFileRequest) -> Result<VaultFile, VaultError> {
        let txn = self.db.transaction();
        let file = state_machine::create_file(self.db.clone(), &txn, &request)?;
        txn.commit()
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        let _ = self.asset_tx.send(());
        Ok(file)
    }

    pub fn create_share(&self, request: CreateShareRequest) -> Result<Share, VaultError> {
        // Only the vault's own tenant can mint share links for it.
        self.reader()
            .get_vault(&request.vault_id, &request.tenant_id)?;
        // Short codes are random; collisions are resolved by retrying
        // with a fresh code, loudly conflicting once attempts run out.
        for _ in 0..MAX_SHORT_CODE_ATTEMPTS {
            let share = ShareBuilder::default()
                .id(data_model::ShareId::generate())
                .vault_id(request.vault_id.clone())
                .target(request.target.clone())
                .short_code(Share::generate_short_code())
                .password_hash(request.password_hash.clone())
                .expires_at(request.expires_at)
                .download_limit(request.download_limit)
                .view_limit(request.view_limit)
                .bandwidth_limit_bytes(request.bandwidth_limit_bytes)
                .allow_download(request.allow_download)
                .allow_preview(request.allow_preview)
                .allow_upload(request.allow_upload)
                .build()
                .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
            let txn = self.db.transaction();
            if state_machine::create_share(self.db.clone(), &txn, &share)? {
                txn.commit()
                    .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
                return Ok(share);
            }
            txn.rollback()
                .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        }
        Err(VaultError::ShortCodeExhausted(MAX_SHORT_CODE_ATTEMPTS))
    }

    pub fn record_share_view(
        &self,
        short_code: &str,
        access: ShareAccess,
    ) -> Result<Share, VaultError> {
        let txn = self.db.transaction();
        let share = state_machine::record_share_view(self.db.clone(), &txn, short_code, access)?;
        txn.commit()
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        Ok(share)
    }

    pub fn authorize_share_download(
        &self,
        short_code: &str,
        access: ShareAccess,
    ) -> Result<(Share, VaultFile), VaultError> {
        let txn = self.db.transaction();
        let authorized =
            state_machine::authorize_share_download(self.db.clone(), &txn, short_code, access)?;
        txn.commit()
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        Ok(authorized)
    }

    pub fn trash_files(
        &self,
        tenant_id: &str,
        vault_id: &VaultId,
        file_ids: &[FileId],
    ) -> Result<Vec<VaultFile>, VaultError> {
        let txn = self.db.transaction();
        let trashed =
            state_machine::trash_files(self.db.clone(), &txn, tenant_id, vault_id, file_ids)?;
        txn.commit()
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        Ok(trashed)
    }

    pub fn restore_files(
        &self,
        tenant_id: &str,
        vault_id: &VaultId,
        file_ids: &[FileId],
    ) -> Result<Vec<VaultFile>, VaultError> {
        let txn = self.db.transaction();
        let restored =
            state_machine::restore_files(self.db.clone(), &txn, tenant_id, vault_id, file_ids)?;
        txn.commit()
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        Ok(restored)
    }

    pub fn purge_files(
        &self,
        vault_id: &VaultId,
        file_ids: &[FileId],
    ) -> Result<PurgeResult, VaultError> {
        let txn = self.db.transaction();
        let result = state_machine::purge_files(self.db.clone(), &txn, vault_id, file_ids)?;
        txn.commit()
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_file, mock_share, mock_vault, TEST_TENANT},
        ShareAccessAction, ShareTarget,
    };

    use super::*;
    use crate::test_state_store::tests::TestStateStore;

    fn view_access() -> ShareAccess {
        ShareAccess {
            ip: "203.0.113.7".to_string(),
            user_agent: "test-agent".to_string(),
            at: 0,
            action: ShareAccessAction::View,
        }
    }

    fn download_access() -> ShareAccess {
        ShareAccess {
            action: ShareAccessAction::Download,
            ..view_access()
        }
    }

    fn upload(state: &FileVaultState, file: VaultFile) -> Result<VaultFile, VaultError> {
        state.create_file(CreateFileRequest {
            tenant_id: TEST_TENANT.to_string(),
            file,
            enqueue_thumbnails: false,
        })
    }

    #[tokio::test]
    async fn test_quota_enforced_across_uploads() -> Result<()> {
        let store = TestStateStore::new()?;
        let vault = mock_vault();
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(vault.clone()),
        })?;

        upload(&store.state, mock_file("a.bin", 600_000))?;
        let err = upload(&store.state, mock_file("b.bin", 500_000)).unwrap_err();
        match err {
            VaultError::QuotaExceeded {
                used_bytes,
                incoming_bytes,
                quota_bytes,
            } => {
                assert_eq!(used_bytes, 600_000);
                assert_eq!(incoming_bytes, 500_000);
                assert_eq!(quota_bytes, 1_000_000);
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
        // the rejected upload must not have consumed quota
        upload(&store.state, mock_file("c.bin", 400_000))?;
        let vault = store.state.reader().get_vault(&vault.id, TEST_TENANT)?;
        assert_eq!(vault.used_bytes, 1_000_000);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_content_is_rejected() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;

        let original = upload(&store.state, mock_file("report.pdf", 1_000))?;
        let mut copy = mock_file("renamed.pdf", 1_000);
        copy.checksum = original.checksum.clone();
        let err = upload(&store.state, copy).unwrap_err();
        match err {
            VaultError::DuplicateFile {
                existing_file_id,
                existing_file_name,
            } => {
                assert_eq!(existing_file_id, original.id);
                assert_eq!(existing_file_name, "report.pdf");
            }
            other => panic!("expected DuplicateFile, got {:?}", other),
        }
        // trashed files still hold their content slot
        store.state.trash_files(
            TEST_TENANT,
            &original.vault_id,
            std::slice::from_ref(&original.id),
        )?;
        let mut copy = mock_file("renamed.pdf", 1_000);
        copy.checksum = original.checksum.clone();
        assert!(matches!(
            upload(&store.state, copy).unwrap_err(),
            VaultError::DuplicateFile { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_trash_restore_round_trip() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let file = upload(&store.state, mock_file("keep.txt", 100))?;

        let trashed = store.state.trash_files(
            TEST_TENANT,
            &file.vault_id,
            std::slice::from_ref(&file.id),
        )?;
        assert!(trashed[0].is_trashed);
        assert!(trashed[0].trashed_at.is_some());

        let restored = store.state.restore_files(
            TEST_TENANT,
            &file.vault_id,
            std::slice::from_ref(&file.id),
        )?;
        assert_eq!(restored[0], file);

        // quota untouched by the soft delete cycle
        let vault = store.state.reader().get_vault(&file.vault_id, TEST_TENANT)?;
        assert_eq!(vault.used_bytes, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_frees_quota_and_dedup_slot() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let a = upload(&store.state, mock_file("a.bin", 700))?;
        let b = upload(&store.state, mock_file("b.bin", 300))?;

        let result = store
            .state
            .purge_files(&a.vault_id, std::slice::from_ref(&a.id))?;
        assert_eq!(result.purged.len(), 1);
        assert_eq!(result.freed_bytes, 700);

        let reader = store.state.reader();
        assert!(reader.get_file(&a.vault_id, &a.id)?.is_none());
        assert!(reader.get_file(&b.vault_id, &b.id)?.is_some());
        assert_eq!(reader.get_vault(&a.vault_id, TEST_TENANT)?.used_bytes, 300);

        // purged content can be uploaded again
        let mut again = mock_file("a2.bin", 700);
        again.checksum = a.checksum.clone();
        upload(&store.state, again)?;

        // ids that no longer resolve are skipped, not failed
        let result = store
            .state
            .purge_files(&a.vault_id, std::slice::from_ref(&a.id))?;
        assert_eq!(result.purged.len(), 0);
        assert_eq!(result.freed_bytes, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_share_view_limit() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let file = upload(&store.state, mock_file("shared.txt", 10))?;
        let share = store.state.create_share(CreateShareRequest {
            tenant_id: TEST_TENANT.to_string(),
            vault_id: file.vault_id.clone(),
            target: ShareTarget::File(file.id.clone()),
            password_hash: None,
            expires_at: None,
            download_limit: None,
            view_limit: Some(2),
            bandwidth_limit_bytes: None,
            allow_download: true,
            allow_preview: true,
            allow_upload: false,
        })?;

        let viewed = store.state.record_share_view(&share.short_code, view_access())?;
        assert_eq!(viewed.views_count, 1);
        let viewed = store.state.record_share_view(&share.short_code, view_access())?;
        assert_eq!(viewed.views_count, 2);
        assert!(matches!(
            store
                .state
                .record_share_view(&share.short_code, view_access())
                .unwrap_err(),
            VaultError::Gone(_)
        ));
        // the counter never passes the limit
        let share = store.state.reader().get_share_by_code(&share.short_code)?.unwrap();
        assert_eq!(share.views_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_share_requires_vault_ownership() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let file = upload(&store.state, mock_file("private.txt", 10))?;

        let err = store
            .state
            .create_share(CreateShareRequest {
                tenant_id: "some-other-tenant".to_string(),
                vault_id: file.vault_id.clone(),
                target: ShareTarget::File(file.id.clone()),
                password_hash: None,
                expires_at: None,
                download_limit: None,
                view_limit: None,
                bandwidth_limit_bytes: None,
                allow_download: true,
                allow_preview: true,
                allow_upload: false,
            })
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_share_download_limit_and_bandwidth() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let file = upload(&store.state, mock_file("payload.bin", 400))?;
        let share = store.state.create_share(CreateShareRequest {
            tenant_id: TEST_TENANT.to_string(),
            vault_id: file.vault_id.clone(),
            target: ShareTarget::File(file.id.clone()),
            password_hash: None,
            expires_at: None,
            download_limit: Some(2),
            view_limit: None,
            bandwidth_limit_bytes: Some(700),
            allow_download: true,
            allow_preview: true,
            allow_upload: false,
        })?;

        let (share_after, downloaded) = store
            .state
            .authorize_share_download(&share.short_code, download_access())?;
        assert_eq!(downloaded.id, file.id);
        assert_eq!(share_after.downloads_count, 1);
        assert_eq!(share_after.bandwidth_used_bytes, 400);

        // a second 400-byte download would pass the 700-byte budget
        assert!(matches!(
            store
                .state
                .authorize_share_download(&share.short_code, download_access())
                .unwrap_err(),
            VaultError::Gone(_)
        ));
        let share = store.state.reader().get_share_by_code(&share.short_code)?.unwrap();
        assert_eq!(share.downloads_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_deactivated_share_reads_as_missing() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let share = mock_share();
        let txn = store.state.db.transaction();
        assert!(state_machine::create_share(store.state.db.clone(), &txn, &share)?);
        txn.commit().map_err(anyhow::Error::new)?;

        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::DeactivateShare(requests::DeactivateShareRequest {
                vault_id: share.vault_id.clone(),
                share_id: share.id.clone(),
            }),
        })?;
        assert!(matches!(
            store
                .state
                .record_share_view(&share.short_code, view_access())
                .unwrap_err(),
            VaultError::NotFound(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_assets_lifecycle() -> Result<()> {
        let store = TestStateStore::new()?;
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let file = store.state.create_file(CreateFileRequest {
            tenant_id: TEST_TENANT.to_string(),
            file: mock_file("photo.jpg", 10),
            enqueue_thumbnails: true,
        })?;

        let jobs = store.state.reader().list_pending_assets(10)?;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].generate_thumbnails);
        assert_eq!(jobs[0].file_key, file.key());

        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::UpdatePendingAssetAttempts(
                requests::UpdatePendingAssetAttemptsRequest {
                    file_key: file.key(),
                    attempts: 1,
                },
            ),
        })?;
        assert_eq!(store.state.reader().list_pending_assets(10)?[0].attempts, 1);

        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::RemovePendingAsset(requests::RemovePendingAssetRequest {
                file_key: file.key(),
            }),
        })?;
        assert!(store.state.reader().list_pending_assets(10)?.is_empty());
        Ok(())
    }
}
