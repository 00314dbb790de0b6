use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::{
    Folder, Share, ShareTarget, ThumbnailSet, Vault, VaultError, VaultFile,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, ToSchema, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing_file: Option<FileMetadata>,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            error: message.to_string(),
            existing_file: None,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API error: {} - {}", self.status_code, self.error);
        }
        (self.status_code, Json(&self)).into_response()
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        let message = e.to_string();
        match e {
            VaultError::Unauthorized => Self::new(StatusCode::UNAUTHORIZED, &message),
            VaultError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, &message),
            VaultError::DuplicateFile { .. } => Self {
                status_code: StatusCode::CONFLICT,
                error: "a file with identical content already exists".to_string(),
                existing_file: None,
            },
            VaultError::ShortCodeExhausted(_) => Self::new(StatusCode::CONFLICT, &message),
            VaultError::QuotaExceeded { .. } => Self::new(StatusCode::BAD_REQUEST, &message),
            VaultError::Gone(_) => Self::new(StatusCode::GONE, &message),
            VaultError::ShareUnauthorized => Self::new(StatusCode::UNAUTHORIZED, &message),
            VaultError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, &message),
            VaultError::Internal(e) => Self::internal_error(e),
        }
    }
}

impl ApiError {
    /// Duplicate uploads carry the conflicting record so clients can link
    /// to it instead of re-uploading.
    pub fn with_existing_file(mut self, file: FileMetadata) -> Self {
        self.existing_file = Some(file);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Thumbnails {
    pub small: Option<String>,
    pub medium: Option<String>,
    pub large: Option<String>,
}

impl From<ThumbnailSet> for Thumbnails {
    fn from(t: ThumbnailSet) -> Self {
        Self {
            small: t.small,
            medium: t.medium,
            large: t.large,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileMetadata {
    pub id: String,
    pub vault_id: String,
    pub folder_id: Option<String>,
    pub name: String,
    pub path: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub extension: String,
    pub checksum: String,
    pub checksum_sha256: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub thumbnails: Thumbnails,
    pub processing_thumbnails: bool,
    pub version: u32,
    pub tags: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub is_trashed: bool,
    pub trashed_at: Option<u64>,
}

impl From<VaultFile> for FileMetadata {
    fn from(file: VaultFile) -> Self {
        let processing_thumbnails = file.is_image() && file.thumbnails.is_empty();
        Self {
            id: file.id.to_string(),
            vault_id: file.vault_id.to_string(),
            folder_id: file.folder_id.map(|f| f.to_string()),
            name: file.name,
            path: file.path,
            mime_type: file.mime_type,
            size_bytes: file.size_bytes,
            extension: file.extension,
            checksum: file.checksum,
            checksum_sha256: file.checksum_sha256,
            width: file.width,
            height: file.height,
            thumbnails: file.thumbnails.into(),
            processing_thumbnails,
            version: file.version,
            tags: file.tags,
            created_at: file.created_at,
            updated_at: file.updated_at,
            is_trashed: file.is_trashed,
            trashed_at: file.trashed_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UploadForm {
    pub vault_id: String,
    pub folder_id: Option<String>,
    #[schema(format = "binary")]
    /// File to upload
    pub file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub id: String,
    pub name: String,
    pub path: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub processing_thumbnails: bool,
}

impl From<VaultFile> for UploadResponse {
    fn from(file: VaultFile) -> Self {
        Self {
            id: file.id.to_string(),
            name: file.name.clone(),
            path: file.path.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size_bytes,
            processing_thumbnails: file.is_image() && file.thumbnails.is_empty(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Pagination {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FileListResponse {
    pub files: Vec<FileMetadata>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListFilesParams {
    pub vault_id: String,
    pub folder_id: Option<String>,
    pub search: Option<String>,
    pub mime_type: Option<String>,
    pub extension: Option<String>,
    pub min_size_bytes: Option<u64>,
    pub max_size_bytes: Option<u64>,
    pub created_after: Option<u64>,
    pub created_before: Option<u64>,
    /// name | size_bytes | created_at | updated_at
    pub sort_by: Option<String>,
    /// asc | desc
    pub sort_order: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub cursor: Option<String>,
    pub trashed: Option<bool>,
    pub include_deleted: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateVault {
    pub name: String,
    pub quota_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VaultResponse {
    pub id: String,
    pub name: String,
    pub quota_bytes: u64,
    pub used_bytes: u64,
    pub created_at: u64,
}

impl From<Vault> for VaultResponse {
    fn from(vault: Vault) -> Self {
        Self {
            id: vault.id.to_string(),
            name: vault.name,
            quota_bytes: vault.quota_bytes,
            used_bytes: vault.used_bytes,
            created_at: vault.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateFolder {
    pub vault_id: String,
    pub parent_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FolderResponse {
    pub id: String,
    pub vault_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub path: String,
    pub created_at: u64,
}

impl From<Folder> for FolderResponse {
    fn from(folder: Folder) -> Self {
        Self {
            id: folder.id.to_string(),
            vault_id: folder.vault_id.to_string(),
            parent_id: folder.parent_id.map(|p| p.to_string()),
            name: folder.name,
            path: folder.path,
            created_at: folder.created_at,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateShare {
    pub vault_id: String,
    pub file_id: Option<String>,
    pub folder_id: Option<String>,
    pub password: Option<String>,
    pub expires_at: Option<u64>,
    pub download_limit: Option<u64>,
    pub view_limit: Option<u64>,
    pub bandwidth_limit_bytes: Option<u64>,
    #[serde(default = "default_true")]
    pub allow_download: bool,
    #[serde(default = "default_true")]
    pub allow_preview: bool,
    #[serde(default)]
    pub allow_upload: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ShareResponse {
    pub id: String,
    pub vault_id: String,
    pub file_id: Option<String>,
    pub folder_id: Option<String>,
    pub short_code: String,
    pub share_url: String,
    pub has_password: bool,
    pub is_active: bool,
    pub expires_at: Option<u64>,
    pub download_limit: Option<u64>,
    pub downloads_count: u64,
    pub view_limit: Option<u64>,
    pub views_count: u64,
    pub bandwidth_limit_bytes: Option<u64>,
    pub bandwidth_used_bytes: u64,
    pub allow_download: bool,
    pub allow_preview: bool,
    pub allow_upload: bool,
    pub created_at: u64,
}

impl ShareResponse {
    pub fn from_share(share: Share, share_url: String) -> Self {
        let (file_id, folder_id) = match &share.target {
            ShareTarget::File(id) => (Some(id.to_string()), None),
            ShareTarget::Folder(id) => (None, Some(id.to_string())),
        };
        Self {
            id: share.id.to_string(),
            vault_id: share.vault_id.to_string(),
            file_id,
            folder_id,
            short_code: share.short_code,
            share_url,
            has_password: share.password_hash.is_some(),
            is_active: share.is_active,
            expires_at: share.expires_at,
            download_limit: share.download_limit,
            downloads_count: share.downloads_count,
            view_limit: share.view_limit,
            views_count: share.views_count,
            bandwidth_limit_bytes: share.bandwidth_limit_bytes,
            bandwidth_used_bytes: share.bandwidth_used_bytes,
            allow_download: share.allow_download,
            allow_preview: share.allow_preview,
            allow_upload: share.allow_upload,
            created_at: share.created_at,
        }
    }
}

/// Public view of a share target: never leaks vault internals, and the
/// payload details stay withheld until the password is verified. Exactly
/// one of `file` and `folder` is set once the share is unlocked.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SharePublicResponse {
    pub short_code: String,
    pub requires_password: bool,
    pub allow_download: bool,
    pub allow_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<SharedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<SharedFolder>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SharedFile {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SharedFolder {
    pub name: String,
    pub path: String,
}

impl From<&VaultFile> for SharedFile {
    fn from(file: &VaultFile) -> Self {
        Self {
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size_bytes,
            width: file.width,
            height: file.height,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ShareAccessBody {
    pub password: Option<String>,
    /// "download" requests a signed URL; anything else verifies and
    /// returns metadata.
    pub action: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ShareDownloadResponse {
    pub download_url: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FileSelection {
    pub vault_id: String,
    pub file_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TrashResponse {
    pub trashed_count: usize,
    pub trashed_files: Vec<FileMetadata>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RestoreResponse {
    pub restored_count: usize,
    pub restored_files: Vec<FileMetadata>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PurgeParams {
    pub vault_id: String,
    /// Comma-separated file ids; every trashed file in the vault when
    /// omitted.
    pub file_ids: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PurgeResponse {
    pub deleted_count: usize,
    pub freed_bytes: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SignedBlobParams {
    pub expires: u64,
    pub sig: String,
}
