pub mod test_objects;

use std::fmt::{self, Display};

use derive_builder::Builder;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use vault_utils::get_epoch_time_in_ms;

/// Number of entries retained in a share's access log ring.
pub const SHARE_ACCESS_LOG_CAPACITY: usize = 50;

/// Alphabet used for public share short codes. URL-safe, no look-alike
/// characters.
pub const SHORT_CODE_ALPHABET: [char; 54] = [
    '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'k', 'm',
    'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G',
    'H', 'J', 'K', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

pub const SHORT_CODE_LEN: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("duplicate content, existing file {existing_file_id} ({existing_file_name})")]
    DuplicateFile {
        existing_file_id: FileId,
        existing_file_name: String,
    },

    #[error("short code space exhausted after {0} attempts")]
    ShortCodeExhausted(usize),

    #[error("vault quota exceeded: used {used_bytes} + incoming {incoming_bytes} > quota {quota_bytes}")]
    QuotaExceeded {
        used_bytes: u64,
        incoming_bytes: u64,
        quota_bytes: u64,
    },

    #[error("share is no longer available: {0}")]
    Gone(&'static str),

    #[error("share password missing or incorrect")]
    ShareUnauthorized,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
        )]
        pub struct $name(String);

        impl $name {
            pub fn new(id: String) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, nanoid!(16)))
            }

            pub fn get(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(VaultId, "vlt");
string_id!(FileId, "fil");
string_id!(FolderId, "fld");
string_id!(ShareId, "shr");

/// Tenant-scoped storage container with a hard byte quota.
///
/// `used_bytes` is mutated only by successful uploads and purges. Soft
/// deletion (trash) never changes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub tenant_id: String,
    pub name: String,
    pub quota_bytes: u64,
    pub used_bytes: u64,
    pub created_at: u64,
}

impl Vault {
    pub fn new(tenant_id: &str, name: &str, quota_bytes: u64) -> Self {
        Self {
            id: VaultId::generate(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            quota_bytes,
            used_bytes: 0,
            created_at: get_epoch_time_in_ms(),
        }
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }

    /// Remaining headroom before the quota rejects a write.
    pub fn available_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ThumbnailSet {
    pub small: Option<String>,
    pub medium: Option<String>,
    pub large: Option<String>,
}

impl ThumbnailSet {
    pub fn is_empty(&self) -> bool {
        self.small.is_none() && self.medium.is_none() && self.large.is_none()
    }

    pub fn storage_keys(&self) -> Vec<&str> {
        [&self.small, &self.medium, &self.large]
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
}

impl ThumbnailSize {
    pub fn all() -> [ThumbnailSize; 3] {
        [
            ThumbnailSize::Small,
            ThumbnailSize::Medium,
            ThumbnailSize::Large,
        ]
    }

    /// Bounding-box edge length in pixels for this variant.
    pub fn max_edge(&self) -> u32 {
        match self {
            ThumbnailSize::Small => 128,
            ThumbnailSize::Medium => 512,
            ThumbnailSize::Large => 1024,
        }
    }
}

/// A stored file record. Created atomically with the blob write;
/// `thumbnails` and `checksum_sha256` are attached later by the asset
/// worker, so readers must tolerate them being unset.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq)]
pub struct VaultFile {
    pub id: FileId,
    pub vault_id: VaultId,
    #[builder(default)]
    pub folder_id: Option<FolderId>,
    pub name: String,
    pub path: String,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[builder(default)]
    pub extension: String,
    /// Fast content checksum (BLAKE3, hex) used for intra-vault dedup.
    pub checksum: String,
    /// Slower cryptographic checksum (SHA-256, hex), computed out of band.
    #[builder(default)]
    pub checksum_sha256: Option<String>,
    #[builder(default)]
    pub width: Option<u32>,
    #[builder(default)]
    pub height: Option<u32>,
    #[builder(default)]
    pub thumbnails: ThumbnailSet,
    #[builder(default = "1")]
    pub version: u32,
    pub owner: String,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub updated_at: u64,
    #[builder(default)]
    pub is_trashed: bool,
    #[builder(default)]
    pub trashed_at: Option<u64>,
    #[builder(default)]
    pub deleted_at: Option<u64>,
}

impl VaultFile {
    pub fn key(&self) -> String {
        VaultFile::key_from(&self.vault_id, &self.id)
    }

    pub fn key_from(vault_id: &VaultId, file_id: &FileId) -> String {
        format!("{}|{}", vault_id, file_id)
    }

    pub fn key_prefix_for_vault(vault_id: &VaultId) -> String {
        format!("{}|", vault_id)
    }

    /// Key into the dedup index mapping content to the canonical file.
    pub fn checksum_index_key(&self) -> String {
        VaultFile::checksum_index_key_from(&self.vault_id, &self.checksum)
    }

    pub fn checksum_index_key_from(vault_id: &VaultId, checksum: &str) -> String {
        format!("{}|{}", vault_id, checksum)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Storage keys owned by this record: the blob plus any thumbnail
    /// variants. Purge must delete all of them.
    pub fn all_storage_keys(&self) -> Vec<String> {
        let mut keys = vec![self.storage_key.clone()];
        keys.extend(self.thumbnails.storage_keys().iter().map(|k| k.to_string()));
        keys
    }

    pub fn thumbnail_key(&self, size: ThumbnailSize) -> String {
        format!("{}.thumb-{}", self.storage_key, size.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct Folder {
    pub id: FolderId,
    pub vault_id: VaultId,
    #[builder(default)]
    pub parent_id: Option<FolderId>,
    pub name: String,
    pub path: String,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl Folder {
    pub fn key(&self) -> String {
        Folder::key_from(&self.vault_id, &self.id)
    }

    pub fn key_from(vault_id: &VaultId, folder_id: &FolderId) -> String {
        format!("{}|{}", vault_id, folder_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShareTarget {
    File(FileId),
    Folder(FolderId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStatus {
    Active,
    Expired,
    ViewLimitReached,
    DownloadLimitReached,
    BandwidthLimitReached,
    Deactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareAccess {
    pub ip: String,
    pub user_agent: String,
    pub at: u64,
    pub action: ShareAccessAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShareAccessAction {
    View,
    Download,
}

/// A public link onto exactly one file or folder. Counters only ever
/// grow; `short_code` never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct Share {
    pub id: ShareId,
    pub vault_id: VaultId,
    pub target: ShareTarget,
    pub short_code: String,
    #[builder(default)]
    pub password_hash: Option<String>,
    #[builder(default = "true")]
    pub is_active: bool,
    #[builder(default)]
    pub expires_at: Option<u64>,
    #[builder(default)]
    pub download_limit: Option<u64>,
    #[builder(default)]
    pub downloads_count: u64,
    #[builder(default)]
    pub view_limit: Option<u64>,
    #[builder(default)]
    pub views_count: u64,
    #[builder(default)]
    pub bandwidth_limit_bytes: Option<u64>,
    #[builder(default)]
    pub bandwidth_used_bytes: u64,
    #[builder(default)]
    pub access_log: Vec<ShareAccess>,
    #[builder(default = "true")]
    pub allow_download: bool,
    #[builder(default = "true")]
    pub allow_preview: bool,
    #[builder(default)]
    pub allow_upload: bool,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl Share {
    pub fn key(&self) -> String {
        Share::key_from(&self.vault_id, &self.id)
    }

    pub fn key_from(vault_id: &VaultId, share_id: &ShareId) -> String {
        format!("{}|{}", vault_id, share_id)
    }

    pub fn generate_short_code() -> String {
        nanoid!(SHORT_CODE_LEN, &SHORT_CODE_ALPHABET)
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Evaluates the share's state machine at `now`. Terminal states are
    /// never reversible; a new share must be created instead.
    pub fn status(&self, now: u64) -> ShareStatus {
        if !self.is_active {
            return ShareStatus::Deactivated;
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return ShareStatus::Expired;
            }
        }
        if let Some(limit) = self.view_limit {
            if self.views_count >= limit {
                return ShareStatus::ViewLimitReached;
            }
        }
        ShareStatus::Active
    }

    /// Checks whether another download of `size_bytes` fits within the
    /// download and bandwidth limits.
    pub fn can_download(&self, size_bytes: u64) -> Result<(), ShareStatus> {
        if let Some(limit) = self.download_limit {
            if self.downloads_count >= limit {
                return Err(ShareStatus::DownloadLimitReached);
            }
        }
        if let Some(limit) = self.bandwidth_limit_bytes {
            if self.bandwidth_used_bytes + size_bytes > limit {
                return Err(ShareStatus::BandwidthLimitReached);
            }
        }
        Ok(())
    }

    /// Appends to the bounded access log, dropping the oldest entry once
    /// the ring is full.
    pub fn log_access(&mut self, access: ShareAccess) {
        if self.access_log.len() >= SHARE_ACCESS_LOG_CAPACITY {
            self.access_log.remove(0);
        }
        self.access_log.push(access);
    }

    pub fn verify_password(&self, candidate: &str) -> bool {
        match &self.password_hash {
            None => true,
            Some(stored) => verify_password_hash(stored, candidate),
        }
    }
}


/// Queued background work for a freshly uploaded file: thumbnail variants
/// (images only) and the secondary checksum. Jobs survive restarts and are
/// retried a bounded number of times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAssetJob {
    pub file_key: String,
    pub generate_thumbnails: bool,
    pub attempts: u32,
    pub enqueued_at: u64,
}

impl PendingAssetJob {
    pub fn new(file_key: String, generate_thumbnails: bool) -> Self {
        Self {
            file_key,
            generate_thumbnails,
            attempts: 0,
            enqueued_at: get_epoch_time_in_ms(),
        }
    }
}

/// Salted SHA-256 password hash, encoded as `<salt-hex>$<digest-hex>`.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::random();
    let digest = salted_digest(&salt, password);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

/// Constant-time comparison of a candidate password against a stored
/// `hash_password` value.
pub fn verify_password_hash(stored: &str, candidate: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    let actual = salted_digest(&salt, candidate);
    actual.as_slice().ct_eq(expected.as_slice()).into()
}

fn salted_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_round_trip() {
        let hash = hash_password("hunter2");
        assert!(verify_password_hash(&hash, "hunter2"));
        assert!(!verify_password_hash(&hash, "hunter3"));
        assert!(!verify_password_hash("garbage", "hunter2"));
    }

    #[test]
    fn test_password_hashes_are_salted() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn test_share_status_transitions() {
        let mut share = test_objects::tests::mock_share();
        assert_eq!(share.status(0), ShareStatus::Active);

        share.expires_at = Some(100);
        assert_eq!(share.status(99), ShareStatus::Active);
        assert_eq!(share.status(100), ShareStatus::Expired);

        share.expires_at = None;
        share.view_limit = Some(2);
        share.views_count = 2;
        assert_eq!(share.status(0), ShareStatus::ViewLimitReached);

        share.is_active = false;
        assert_eq!(share.status(0), ShareStatus::Deactivated);
    }

    #[test]
    fn test_share_download_limits() {
        let mut share = test_objects::tests::mock_share();
        share.download_limit = Some(1);
        assert!(share.can_download(10).is_ok());
        share.downloads_count = 1;
        assert_eq!(
            share.can_download(10),
            Err(ShareStatus::DownloadLimitReached)
        );

        share.download_limit = None;
        share.bandwidth_limit_bytes = Some(100);
        share.bandwidth_used_bytes = 95;
        assert_eq!(
            share.can_download(10),
            Err(ShareStatus::BandwidthLimitReached)
        );
        assert!(share.can_download(5).is_ok());
    }

    #[test]
    fn test_access_log_is_bounded() {
        let mut share = test_objects::tests::mock_share();
        for i in 0..(SHARE_ACCESS_LOG_CAPACITY + 5) {
            share.log_access(ShareAccess {
                ip: format!("10.0.0.{}", i),
                user_agent: "test".to_string(),
                at: i as u64,
                action: ShareAccessAction::View,
            });
        }
        assert_eq!(share.access_log.len(), SHARE_ACCESS_LOG_CAPACITY);
        // oldest entries dropped first
        assert_eq!(share.access_log[0].at, 5);
    }

    #[test]
    fn test_file_storage_keys_include_thumbnails() {
        let mut file = test_objects::tests::mock_file("a.png", 10);
        assert_eq!(file.all_storage_keys().len(), 1);
        file.thumbnails.small = Some("k.thumb-small".to_string());
        file.thumbnails.large = Some("k.thumb-large".to_string());
        assert_eq!(file.all_storage_keys().len(), 3);
    }
}
