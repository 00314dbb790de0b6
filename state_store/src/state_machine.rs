use std::sync::Arc;

use anyhow::anyhow;
use data_model::{
    FileId, Folder, PendingAssetJob, Share, ShareAccess, ShareAccessAction, ShareStatus,
    ShareTarget, ThumbnailSet, Vault, VaultError, VaultFile, VaultId,
};
use rocksdb::{ColumnFamily, Transaction, TransactionDB};
use strum::AsRefStr;
use tracing::info;
use vault_utils::get_epoch_time_in_ms;

use super::serializer::{JsonEncode, JsonEncoder};
use crate::requests::{CreateFileRequest, PurgeResult};

#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum VaultObjectsColumns {
    Vaults,        //  vault_id -> Vault
    Folders,       //  vault_id|folder_id -> Folder
    Files,         //  vault_id|file_id -> VaultFile
    FileChecksums, //  vault_id|checksum -> file key
    Shares,        //  vault_id|share_id -> Share
    ShareCodes,    //  short_code -> share key
    PendingAssets, //  file key -> PendingAssetJob
}

impl VaultObjectsColumns {
    pub fn cf_db<'a>(&'a self, db: &'a TransactionDB) -> &'a ColumnFamily {
        db.cf_handle(self.as_ref())
            .unwrap_or_else(|| panic!("failed to get column family handle for {}", self.as_ref()))
    }
}

fn db_err(e: rocksdb::Error) -> VaultError {
    VaultError::Internal(anyhow::Error::new(e))
}

fn get_in_txn<T: serde::de::DeserializeOwned>(
    txn: &Transaction<TransactionDB>,
    cf: &ColumnFamily,
    key: &[u8],
) -> Result<Option<T>, VaultError> {
    let bytes = txn.get_cf(cf, key).map_err(db_err)?;
    match bytes {
        Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
        None => Ok(None),
    }
}

fn get_for_update<T: serde::de::DeserializeOwned>(
    txn: &Transaction<TransactionDB>,
    cf: &ColumnFamily,
    key: &[u8],
) -> Result<Option<T>, VaultError> {
    let bytes = txn.get_for_update_cf(cf, key, true).map_err(db_err)?;
    match bytes {
        Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
        None => Ok(None),
    }
}

fn put_in_txn<T: serde::Serialize + std::fmt::Debug>(
    txn: &Transaction<TransactionDB>,
    cf: &ColumnFamily,
    key: &[u8],
    value: &T,
) -> Result<(), VaultError> {
    let serialized = JsonEncoder::encode(value)?;
    txn.put_cf(cf, key, serialized).map_err(db_err)
}

pub(crate) fn create_vault(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    vault: &Vault,
) -> Result<(), VaultError> {
    put_in_txn(
        txn,
        VaultObjectsColumns::Vaults.cf_db(&db),
        vault.key().as_bytes(),
        vault,
    )
}

pub(crate) fn create_folder(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    folder: &Folder,
) -> Result<(), VaultError> {
    let vault: Option<Vault> = get_in_txn(
        txn,
        VaultObjectsColumns::Vaults.cf_db(&db),
        folder.vault_id.get().as_bytes(),
    )?;
    if vault.is_none() {
        return Err(VaultError::NotFound("vault"));
    }
    put_in_txn(
        txn,
        VaultObjectsColumns::Folders.cf_db(&db),
        folder.key().as_bytes(),
        folder,
    )
}

/// Commits an upload. Holds the vault row lock across the dedup lookup,
/// the quota check, the record insert and the `used_bytes` increment so
/// concurrent uploads into the same vault serialize here.
pub(crate) fn create_file(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CreateFileRequest,
) -> Result<VaultFile, VaultError> {
    let vaults_cf = VaultObjectsColumns::Vaults.cf_db(&db);
    let mut vault: Vault = get_for_update(txn, vaults_cf, req.file.vault_id.get().as_bytes())?
        .ok_or(VaultError::NotFound("vault"))?;
    if vault.tenant_id != req.tenant_id {
        return Err(VaultError::NotFound("vault"));
    }

    // Dedup against any non-purged file with the same content, trashed
    // files included.
    let checksums_cf = VaultObjectsColumns::FileChecksums.cf_db(&db);
    let index_key = req.file.checksum_index_key();
    if let Some(existing_key) = txn
        .get_cf(checksums_cf, index_key.as_bytes())
        .map_err(db_err)?
    {
        let existing: Option<VaultFile> =
            get_in_txn(txn, VaultObjectsColumns::Files.cf_db(&db), &existing_key)?;
        if let Some(existing) = existing.filter(|f| f.deleted_at.is_none()) {
            return Err(VaultError::DuplicateFile {
                existing_file_id: existing.id,
                existing_file_name: existing.name,
            });
        }
    }

    if vault.used_bytes + req.file.size_bytes > vault.quota_bytes {
        return Err(VaultError::QuotaExceeded {
            used_bytes: vault.used_bytes,
            incoming_bytes: req.file.size_bytes,
            quota_bytes: vault.quota_bytes,
        });
    }

    let file_key = req.file.key();
    put_in_txn(
        txn,
        VaultObjectsColumns::Files.cf_db(&db),
        file_key.as_bytes(),
        &req.file,
    )?;
    txn.put_cf(checksums_cf, index_key.as_bytes(), file_key.as_bytes())
        .map_err(db_err)?;

    let job = PendingAssetJob::new(file_key.clone(), req.enqueue_thumbnails);
    put_in_txn(
        txn,
        VaultObjectsColumns::PendingAssets.cf_db(&db),
        file_key.as_bytes(),
        &job,
    )?;

    vault.used_bytes += req.file.size_bytes;
    put_in_txn(txn, vaults_cf, vault.key().as_bytes(), &vault)?;
    Ok(req.file.clone())
}

/// Inserts a share under its short code. Returns false without writing if
/// the code is already taken so the caller can retry with a fresh one.
pub(crate) fn create_share(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    share: &Share,
) -> Result<bool, VaultError> {
    let codes_cf = VaultObjectsColumns::ShareCodes.cf_db(&db);
    let taken = txn
        .get_for_update_cf(codes_cf, share.short_code.as_bytes(), true)
        .map_err(db_err)?
        .is_some();
    if taken {
        return Ok(false);
    }
    put_in_txn(
        txn,
        VaultObjectsColumns::Shares.cf_db(&db),
        share.key().as_bytes(),
        share,
    )?;
    txn.put_cf(
        codes_cf,
        share.short_code.as_bytes(),
        share.key().as_bytes(),
    )
    .map_err(db_err)?;
    Ok(true)
}

fn share_by_code_for_update(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    short_code: &str,
) -> Result<Share, VaultError> {
    let share_key = txn
        .get_cf(
            VaultObjectsColumns::ShareCodes.cf_db(db),
            short_code.as_bytes(),
        )
        .map_err(db_err)?
        .ok_or(VaultError::NotFound("share"))?;
    let share: Share = get_for_update(txn, VaultObjectsColumns::Shares.cf_db(db), &share_key)?
        .ok_or(VaultError::NotFound("share"))?;
    Ok(share)
}

/// Records a public view of a share. The state check and the counter
/// increment happen under the share row lock, so the view limit is never
/// overshot by concurrent resolves.
pub(crate) fn record_share_view(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    short_code: &str,
    access: ShareAccess,
) -> Result<Share, VaultError> {
    let mut share = share_by_code_for_update(&db, txn, short_code)?;
    match share.status(get_epoch_time_in_ms()) {
        ShareStatus::Active => {}
        ShareStatus::Deactivated => return Err(VaultError::NotFound("share")),
        ShareStatus::Expired => return Err(VaultError::Gone("share link has expired")),
        _ => return Err(VaultError::Gone("share view limit reached")),
    }
    share.views_count += 1;
    share.log_access(access);
    put_in_txn(
        txn,
        VaultObjectsColumns::Shares.cf_db(&db),
        share.key().as_bytes(),
        &share,
    )?;
    Ok(share)
}

/// Authorizes one download over a share and charges the download and
/// bandwidth counters in the same transaction. A signed URL must only be
/// issued when this returns Ok.
pub(crate) fn authorize_share_download(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    short_code: &str,
    access: ShareAccess,
) -> Result<(Share, VaultFile), VaultError> {
    let mut share = share_by_code_for_update(&db, txn, short_code)?;
    match share.status(get_epoch_time_in_ms()) {
        ShareStatus::Active => {}
        ShareStatus::Deactivated => return Err(VaultError::NotFound("share")),
        ShareStatus::Expired => return Err(VaultError::Gone("share link has expired")),
        _ => return Err(VaultError::Gone("share view limit reached")),
    }
    if !share.allow_download {
        return Err(VaultError::Validation(
            "downloads are disabled for this share".to_string(),
        ));
    }
    let file_id = match &share.target {
        ShareTarget::File(file_id) => file_id.clone(),
        ShareTarget::Folder(_) => {
            return Err(VaultError::Validation(
                "folder archive download is not yet supported".to_string(),
            ));
        }
    };
    let file: VaultFile = get_in_txn::<VaultFile>(
        txn,
        VaultObjectsColumns::Files.cf_db(&db),
        VaultFile::key_from(&share.vault_id, &file_id).as_bytes(),
    )?
    .filter(|f| f.deleted_at.is_none() && !f.is_trashed)
    .ok_or(VaultError::NotFound("file"))?;

    if let Err(status) = share.can_download(file.size_bytes) {
        return Err(match status {
            ShareStatus::DownloadLimitReached => VaultError::Gone("share download limit reached"),
            _ => VaultError::Gone("share bandwidth limit reached"),
        });
    }
    share.downloads_count += 1;
    share.bandwidth_used_bytes += file.size_bytes;
    debug_assert_eq!(access.action, ShareAccessAction::Download);
    share.log_access(access);
    put_in_txn(
        txn,
        VaultObjectsColumns::Shares.cf_db(&db),
        share.key().as_bytes(),
        &share,
    )?;
    Ok((share, file))
}

pub(crate) fn deactivate_share(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    vault_id: &VaultId,
    share_id: &data_model::ShareId,
) -> Result<(), VaultError> {
    let shares_cf = VaultObjectsColumns::Shares.cf_db(&db);
    let key = Share::key_from(vault_id, share_id);
    let mut share: Share = get_for_update(txn, shares_cf, key.as_bytes())?
        .ok_or(VaultError::NotFound("share"))?;
    share.is_active = false;
    put_in_txn(txn, shares_cf, key.as_bytes(), &share)
}

fn load_owned_file(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    tenant_id: &str,
    vault_id: &VaultId,
    file_id: &FileId,
) -> Result<VaultFile, VaultError> {
    let vault: Vault = get_in_txn(
        txn,
        VaultObjectsColumns::Vaults.cf_db(db),
        vault_id.get().as_bytes(),
    )?
    .ok_or(VaultError::NotFound("vault"))?;
    if vault.tenant_id != tenant_id {
        return Err(VaultError::NotFound("vault"));
    }
    let file: VaultFile = get_for_update::<VaultFile>(
        txn,
        VaultObjectsColumns::Files.cf_db(db),
        VaultFile::key_from(vault_id, file_id).as_bytes(),
    )?
    .filter(|f| f.deleted_at.is_none())
    .ok_or(VaultError::NotFound("file"))?;
    Ok(file)
}

/// Soft-deletes files. Only the trash marker fields change; the quota and
/// the dedup index are untouched so a restore is an exact round trip.
pub(crate) fn trash_files(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    tenant_id: &str,
    vault_id: &VaultId,
    file_ids: &[FileId],
) -> Result<Vec<VaultFile>, VaultError> {
    let files_cf = VaultObjectsColumns::Files.cf_db(&db);
    let now = get_epoch_time_in_ms();
    let mut trashed = Vec::new();
    for file_id in file_ids {
        let mut file = load_owned_file(&db, txn, tenant_id, vault_id, file_id)?;
        if file.is_trashed {
            continue;
        }
        file.is_trashed = true;
        file.trashed_at = Some(now);
        put_in_txn(txn, files_cf, file.key().as_bytes(), &file)?;
        trashed.push(file);
    }
    Ok(trashed)
}

pub(crate) fn restore_files(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    tenant_id: &str,
    vault_id: &VaultId,
    file_ids: &[FileId],
) -> Result<Vec<VaultFile>, VaultError> {
    let files_cf = VaultObjectsColumns::Files.cf_db(&db);
    let mut restored = Vec::new();
    for file_id in file_ids {
        let mut file = load_owned_file(&db, txn, tenant_id, vault_id, file_id)?;
        if !file.is_trashed {
            continue;
        }
        file.is_trashed = false;
        file.trashed_at = None;
        put_in_txn(txn, files_cf, file.key().as_bytes(), &file)?;
        restored.push(file);
    }
    Ok(restored)
}

/// Removes purged files from visibility and reconciles the vault quota.
/// Blob deletion happens before this is called; ids whose records are
/// already gone are skipped rather than failed.
pub(crate) fn purge_files(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    vault_id: &VaultId,
    file_ids: &[FileId],
) -> Result<PurgeResult, VaultError> {
    let files_cf = VaultObjectsColumns::Files.cf_db(&db);
    let checksums_cf = VaultObjectsColumns::FileChecksums.cf_db(&db);
    let pending_cf = VaultObjectsColumns::PendingAssets.cf_db(&db);
    let vaults_cf = VaultObjectsColumns::Vaults.cf_db(&db);
    let now = get_epoch_time_in_ms();

    let mut purged = Vec::new();
    let mut freed_bytes: u64 = 0;
    for file_id in file_ids {
        let key = VaultFile::key_from(vault_id, file_id);
        let Some(mut file) = get_for_update::<VaultFile>(txn, files_cf, key.as_bytes())? else {
            continue;
        };
        if file.deleted_at.is_some() {
            continue;
        }
        file.deleted_at = Some(now);
        put_in_txn(txn, files_cf, key.as_bytes(), &file)?;

        // Drop the dedup entry only if it still points at this record; a
        // later re-upload of the same bytes owns the slot otherwise.
        let index_key = file.checksum_index_key();
        if let Some(indexed) = txn.get_cf(checksums_cf, index_key.as_bytes()).map_err(db_err)? {
            if indexed == key.as_bytes() {
                txn.delete_cf(checksums_cf, index_key.as_bytes())
                    .map_err(db_err)?;
            }
        }
        txn.delete_cf(pending_cf, key.as_bytes()).map_err(db_err)?;
        freed_bytes += file.size_bytes;
        purged.push(file);
    }

    if freed_bytes > 0 {
        let mut vault: Vault = get_for_update(txn, vaults_cf, vault_id.get().as_bytes())?
            .ok_or(VaultError::NotFound("vault"))?;
        vault.used_bytes = vault.used_bytes.saturating_sub(freed_bytes);
        put_in_txn(txn, vaults_cf, vault.key().as_bytes(), &vault)?;
        info!(
            vault_id = %vault_id,
            freed_bytes,
            used_bytes = vault.used_bytes,
            "reconciled vault usage after purge"
        );
    }
    Ok(PurgeResult {
        purged,
        freed_bytes,
    })
}

pub(crate) fn attach_thumbnails(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    file_key: &str,
    thumbnails: &ThumbnailSet,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<(), VaultError> {
    let files_cf = VaultObjectsColumns::Files.cf_db(&db);
    let mut file: VaultFile = get_for_update(txn, files_cf, file_key.as_bytes())?
        .ok_or(VaultError::NotFound("file"))?;
    file.thumbnails = thumbnails.clone();
    file.width = width;
    file.height = height;
    file.updated_at = get_epoch_time_in_ms();
    put_in_txn(txn, files_cf, file_key.as_bytes(), &file)
}

pub(crate) fn set_secondary_checksum(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    file_key: &str,
    checksum_sha256: &str,
) -> Result<(), VaultError> {
    let files_cf = VaultObjectsColumns::Files.cf_db(&db);
    let mut file: VaultFile = get_for_update(txn, files_cf, file_key.as_bytes())?
        .ok_or(VaultError::NotFound("file"))?;
    file.checksum_sha256 = Some(checksum_sha256.to_string());
    put_in_txn(txn, files_cf, file_key.as_bytes(), &file)
}

pub(crate) fn update_pending_asset_attempts(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    file_key: &str,
    attempts: u32,
) -> Result<(), VaultError> {
    let pending_cf = VaultObjectsColumns::PendingAssets.cf_db(&db);
    let mut job: PendingAssetJob = get_for_update(txn, pending_cf, file_key.as_bytes())?
        .ok_or_else(|| VaultError::Internal(anyhow!("pending asset job missing: {}", file_key)))?;
    job.attempts = attempts;
    put_in_txn(txn, pending_cf, file_key.as_bytes(), &job)
}

pub(crate) fn remove_pending_asset(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    file_key: &str,
) -> Result<(), VaultError> {
    txn.delete_cf(
        VaultObjectsColumns::PendingAssets.cf_db(&db),
        file_key.as_bytes(),
    )
    .map_err(db_err)
}
