use data_model::{Folder, ShareId, ShareTarget, ThumbnailSet, Vault, VaultFile, VaultId};

pub struct VaultUpdateRequest {
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    CreateVault(Vault),
    CreateFolder(Folder),
    AttachThumbnails(AttachThumbnailsRequest),
    SetSecondaryChecksum(SetSecondaryChecksumRequest),
    UpdatePendingAssetAttempts(UpdatePendingAssetAttemptsRequest),
    RemovePendingAsset(RemovePendingAssetRequest),
    DeactivateShare(DeactivateShareRequest),
    Noop,
}

/// Upload commit: quota check, dedup check, record insert and the
/// `used_bytes` increment all happen inside one store transaction.
#[derive(Debug, Clone)]
pub struct CreateFileRequest {
    pub tenant_id: String,
    pub file: VaultFile,
    pub enqueue_thumbnails: bool,
}

#[derive(Debug, Clone)]
pub struct CreateShareRequest {
    pub tenant_id: String,
    pub vault_id: VaultId,
    pub target: ShareTarget,
    pub password_hash: Option<String>,
    pub expires_at: Option<u64>,
    pub download_limit: Option<u64>,
    pub view_limit: Option<u64>,
    pub bandwidth_limit_bytes: Option<u64>,
    pub allow_download: bool,
    pub allow_preview: bool,
    pub allow_upload: bool,
}

#[derive(Debug, Clone)]
pub struct AttachThumbnailsRequest {
    pub file_key: String,
    pub thumbnails: ThumbnailSet,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SetSecondaryChecksumRequest {
    pub file_key: String,
    pub checksum_sha256: String,
}

#[derive(Debug, Clone)]
pub struct UpdatePendingAssetAttemptsRequest {
    pub file_key: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RemovePendingAssetRequest {
    pub file_key: String,
}

#[derive(Debug, Clone)]
pub struct DeactivateShareRequest {
    pub vault_id: VaultId,
    pub share_id: ShareId,
}

#[derive(Debug)]
pub struct PurgeResult {
    pub purged: Vec<VaultFile>,
    pub freed_bytes: u64,
}
