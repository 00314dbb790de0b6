use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use data_model::{
    FileId, Folder, FolderId, PendingAssetJob, Share, Vault, VaultError, VaultFile, VaultId,
};
use rocksdb::{Direction, IteratorMode, ReadOptions, TransactionDB};
use serde::{Deserialize, Serialize};

use super::{
    serializer::{JsonEncode, JsonEncoder},
    state_machine::VaultObjectsColumns,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileSortField {
    Name,
    SizeBytes,
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Listing parameters for one vault. Offset pagination is the default;
/// setting `cursor` switches to keyset pagination anchored on the last
/// returned row.
#[derive(Debug, Clone)]
pub struct FileListQuery {
    pub vault_id: VaultId,
    pub folder_id: Option<FolderId>,
    pub search: Option<String>,
    pub mime_type: Option<String>,
    pub extension: Option<String>,
    pub min_size_bytes: Option<u64>,
    pub max_size_bytes: Option<u64>,
    pub created_after: Option<u64>,
    pub created_before: Option<u64>,
    pub sort_by: FileSortField,
    pub sort_order: SortOrder,
    pub limit: usize,
    pub offset: usize,
    pub cursor: Option<String>,
    pub trashed: bool,
    pub include_deleted: bool,
}

impl FileListQuery {
    pub fn for_vault(vault_id: VaultId) -> Self {
        Self {
            vault_id,
            folder_id: None,
            search: None,
            mime_type: None,
            extension: None,
            min_size_bytes: None,
            max_size_bytes: None,
            created_after: None,
            created_before: None,
            sort_by: FileSortField::CreatedAt,
            sort_order: SortOrder::Desc,
            limit: 50,
            offset: 0,
            cursor: None,
            trashed: false,
            include_deleted: false,
        }
    }

    /// Free-text search, trash views, deleted-inclusive views and cursor
    /// walks always read through to the store. Range filters are left out
    /// of the cache key scheme, so they bypass the cache as well.
    pub fn is_cacheable(&self) -> bool {
        self.search.as_deref().map_or(true, |s| s.is_empty())
            && !self.trashed
            && !self.include_deleted
            && self.cursor.is_none()
            && self.min_size_bytes.is_none()
            && self.max_size_bytes.is_none()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }

    pub fn cache_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            prefix,
            self.vault_id,
            self.folder_id
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default(),
            self.search.as_deref().unwrap_or_default(),
            self.mime_type.as_deref().unwrap_or_default(),
            self.extension.as_deref().unwrap_or_default(),
            self.sort_by.as_ref(),
            self.sort_order.as_ref(),
            self.limit,
            self.offset,
        )
    }

    fn matches(&self, file: &VaultFile) -> bool {
        if file.deleted_at.is_some() && !self.include_deleted {
            return false;
        }
        if file.is_trashed != self.trashed && !self.include_deleted {
            return false;
        }
        if let Some(folder_id) = &self.folder_id {
            if file.folder_id.as_ref() != Some(folder_id) {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            let in_name = file.name.to_lowercase().contains(&needle);
            let in_tags = file.tags.iter().any(|t| t.to_lowercase().contains(&needle));
            if !in_name && !in_tags {
                return false;
            }
        }
        if let Some(mime) = &self.mime_type {
            if !file.mime_type.starts_with(mime.as_str()) {
                return false;
            }
        }
        if let Some(ext) = &self.extension {
            if !file.extension.eq_ignore_ascii_case(ext) {
                return false;
            }
        }
        if let Some(min) = self.min_size_bytes {
            if file.size_bytes < min {
                return false;
            }
        }
        if let Some(max) = self.max_size_bytes {
            if file.size_bytes > max {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if file.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if file.created_at > before {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileListPage {
    pub files: Vec<VaultFile>,
    pub total: usize,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Sort keys compare lexicographically. Numeric fields are zero-padded so
/// the byte order matches the numeric order.
fn sort_key(file: &VaultFile, field: FileSortField) -> String {
    match field {
        FileSortField::Name => file.name.to_lowercase(),
        FileSortField::SizeBytes => format!("{:020}", file.size_bytes),
        FileSortField::CreatedAt => format!("{:020}", file.created_at),
        FileSortField::UpdatedAt => format!("{:020}", file.updated_at),
    }
}

fn encode_cursor(sort_key: &str, file_id: &FileId) -> String {
    BASE64.encode(format!("{}|{}", sort_key, file_id))
}

fn decode_cursor(cursor: &str) -> Result<(String, String), VaultError> {
    let decoded = BASE64
        .decode(cursor)
        .map_err(|_| VaultError::Validation("malformed pagination cursor".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| VaultError::Validation("malformed pagination cursor".to_string()))?;
    // File ids never contain '|'; the sort key may.
    decoded
        .rsplit_once('|')
        .map(|(k, id)| (k.to_string(), id.to_string()))
        .ok_or_else(|| VaultError::Validation("malformed pagination cursor".to_string()))
}

pub struct VaultReader {
    db: Arc<TransactionDB>,
}

impl VaultReader {
    pub fn new(db: Arc<TransactionDB>) -> Self {
        Self { db }
    }

    fn get_from_cf<T: serde::de::DeserializeOwned>(
        &self,
        column: VaultObjectsColumns,
        key: &[u8],
    ) -> Result<Option<T>, VaultError> {
        let bytes = self
            .db
            .get_cf(column.cf_db(&self.db), key)
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
        match bytes {
            Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn rows_with_prefix<T: serde::de::DeserializeOwned>(
        &self,
        column: VaultObjectsColumns,
        prefix: &str,
    ) -> Result<Vec<T>, VaultError> {
        let cf = column.cf_db(&self.db);
        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(4_194_304);
        let iter = self.db.iterator_cf_opt(
            cf,
            read_options,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        let mut rows = Vec::new();
        for kv in iter {
            let (key, value) = kv.map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            rows.push(JsonEncoder::decode(&value)?);
        }
        Ok(rows)
    }

    pub fn get_vault(&self, vault_id: &VaultId, tenant_id: &str) -> Result<Vault, VaultError> {
        let vault: Vault = self
            .get_from_cf(VaultObjectsColumns::Vaults, vault_id.get().as_bytes())?
            .ok_or(VaultError::NotFound("vault"))?;
        if vault.tenant_id != tenant_id {
            return Err(VaultError::NotFound("vault"));
        }
        Ok(vault)
    }

    pub fn get_file(
        &self,
        vault_id: &VaultId,
        file_id: &FileId,
    ) -> Result<Option<VaultFile>, VaultError> {
        let file: Option<VaultFile> = self.get_from_cf(
            VaultObjectsColumns::Files,
            VaultFile::key_from(vault_id, file_id).as_bytes(),
        )?;
        Ok(file.filter(|f| f.deleted_at.is_none()))
    }

    pub fn get_file_by_key(&self, file_key: &str) -> Result<Option<VaultFile>, VaultError> {
        self.get_from_cf(VaultObjectsColumns::Files, file_key.as_bytes())
    }

    pub fn get_folder(
        &self,
        vault_id: &VaultId,
        folder_id: &FolderId,
    ) -> Result<Option<Folder>, VaultError> {
        self.get_from_cf(
            VaultObjectsColumns::Folders,
            Folder::key_from(vault_id, folder_id).as_bytes(),
        )
    }

    pub fn get_share_by_code(&self, short_code: &str) -> Result<Option<Share>, VaultError> {
        let Some(share_key) = self
            .db
            .get_cf(
                VaultObjectsColumns::ShareCodes.cf_db(&self.db),
                short_code.as_bytes(),
            )
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?
        else {
            return Ok(None);
        };
        self.get_from_cf(VaultObjectsColumns::Shares, &share_key)
    }

    /// Dedup lookup outside a write path; the authoritative check runs
    /// again inside the upload transaction.
    pub fn find_file_by_checksum(
        &self,
        vault_id: &VaultId,
        checksum: &str,
    ) -> Result<Option<VaultFile>, VaultError> {
        let Some(file_key) = self
            .db
            .get_cf(
                VaultObjectsColumns::FileChecksums.cf_db(&self.db),
                VaultFile::checksum_index_key_from(vault_id, checksum).as_bytes(),
            )
            .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?
        else {
            return Ok(None);
        };
        let file: Option<VaultFile> = self.get_from_cf(VaultObjectsColumns::Files, &file_key)?;
        Ok(file.filter(|f| f.deleted_at.is_none()))
    }

    pub fn list_pending_assets(&self, limit: usize) -> Result<Vec<PendingAssetJob>, VaultError> {
        let mut jobs: Vec<PendingAssetJob> =
            self.rows_with_prefix(VaultObjectsColumns::PendingAssets, "")?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Runs a listing query: scan the vault's key range, filter, sort,
    /// then paginate by offset or by cursor.
    pub fn list_files(&self, query: &FileListQuery) -> Result<FileListPage, VaultError> {
        let prefix = VaultFile::key_prefix_for_vault(&query.vault_id);
        let files: Vec<VaultFile> = self.rows_with_prefix(VaultObjectsColumns::Files, &prefix)?;

        let mut matched: Vec<(String, VaultFile)> = files
            .into_iter()
            .filter(|f| query.matches(f))
            .map(|f| (sort_key(&f, query.sort_by), f))
            .collect();
        matched.sort_by(|(ka, fa), (kb, fb)| {
            let ordering = (ka, &fa.id).cmp(&(kb, &fb.id));
            match query.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        let total = matched.len();

        let remaining: Vec<(String, VaultFile)> = match &query.cursor {
            Some(cursor) => {
                let (after_key, after_id) = decode_cursor(cursor)?;
                let after = (after_key, FileId::new(after_id));
                // Strictly-after comparison keeps rows stable under
                // concurrent inserts and deletes around the cursor.
                matched
                    .into_iter()
                    .filter(|(k, f)| {
                        let current = (k.clone(), f.id.clone());
                        match query.sort_order {
                            SortOrder::Asc => current > after,
                            SortOrder::Desc => current < after,
                        }
                    })
                    .collect()
            }
            None => matched.into_iter().skip(query.offset).collect(),
        };

        let has_more = remaining.len() > query.limit;
        let page: Vec<(String, VaultFile)> = remaining.into_iter().take(query.limit).collect();
        let next_cursor = if has_more {
            page.last().map(|(k, f)| encode_cursor(k, &f.id))
        } else {
            None
        };
        Ok(FileListPage {
            files: page.into_iter().map(|(_, f)| f).collect(),
            total,
            has_more,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::test_objects::tests::{mock_file, mock_vault, TEST_TENANT};

    use super::*;
    use crate::{
        requests::{CreateFileRequest, RequestPayload, VaultUpdateRequest},
        test_state_store::tests::TestStateStore,
    };

    fn seed(store: &TestStateStore, names_and_sizes: &[(&str, u64)]) -> Result<Vec<VaultFile>> {
        store.state.write(VaultUpdateRequest {
            payload: RequestPayload::CreateVault(mock_vault()),
        })?;
        let mut files = Vec::new();
        for (name, size) in names_and_sizes {
            let file = store.state.create_file(CreateFileRequest {
                tenant_id: TEST_TENANT.to_string(),
                file: mock_file(name, *size),
                enqueue_thumbnails: false,
            })?;
            files.push(file);
        }
        Ok(files)
    }

    #[tokio::test]
    async fn test_list_filters_and_sorting() -> Result<()> {
        let store = TestStateStore::new()?;
        seed(
            &store,
            &[("cherry.txt", 30), ("apple.txt", 10), ("banana.txt", 20)],
        )?;
        let reader = store.state.reader();

        let mut query = FileListQuery::for_vault(mock_vault().id);
        query.sort_by = FileSortField::Name;
        query.sort_order = SortOrder::Asc;
        let page = reader.list_files(&query)?;
        assert_eq!(
            page.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["apple.txt", "banana.txt", "cherry.txt"]
        );
        assert_eq!(page.total, 3);
        assert!(!page.has_more);

        query.sort_by = FileSortField::SizeBytes;
        query.sort_order = SortOrder::Desc;
        let page = reader.list_files(&query)?;
        assert_eq!(page.files[0].name, "cherry.txt");

        query.search = Some("APP".to_string());
        let page = reader.list_files(&query)?;
        assert_eq!(page.files.len(), 1);
        assert_eq!(page.files[0].name, "apple.txt");
        Ok(())
    }

    #[tokio::test]
    async fn test_trashed_files_hidden_from_default_listing() -> Result<()> {
        let store = TestStateStore::new()?;
        let files = seed(&store, &[("a.txt", 1), ("b.txt", 1)])?;
        store.state.trash_files(
            TEST_TENANT,
            &files[0].vault_id,
            std::slice::from_ref(&files[0].id),
        )?;
        let reader = store.state.reader();

        let query = FileListQuery::for_vault(files[0].vault_id.clone());
        let page = reader.list_files(&query)?;
        assert_eq!(page.files.len(), 1);
        assert_eq!(page.files[0].name, "b.txt");

        let mut trash_view = query.clone();
        trash_view.trashed = true;
        let page = reader.list_files(&trash_view)?;
        assert_eq!(page.files.len(), 1);
        assert_eq!(page.files[0].name, "a.txt");
        Ok(())
    }

    #[tokio::test]
    async fn test_offset_pagination() -> Result<()> {
        let store = TestStateStore::new()?;
        seed(&store, &[("a", 1), ("b", 1), ("c", 1), ("d", 1), ("e", 1)])?;
        let reader = store.state.reader();

        let mut query = FileListQuery::for_vault(mock_vault().id);
        query.sort_by = FileSortField::Name;
        query.sort_order = SortOrder::Asc;
        query.limit = 2;
        query.offset = 2;
        let page = reader.list_files(&query)?;
        assert_eq!(
            page.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        Ok(())
    }

    #[tokio::test]
    async fn test_cursor_walk_is_stable_under_inserts() -> Result<()> {
        let store = TestStateStore::new()?;
        seed(&store, &[("b", 1), ("d", 1), ("f", 1), ("h", 1)])?;
        let reader = store.state.reader();

        let mut query = FileListQuery::for_vault(mock_vault().id);
        query.sort_by = FileSortField::Name;
        query.sort_order = SortOrder::Asc;
        query.limit = 2;

        let first = reader.list_files(&query)?;
        assert_eq!(
            first.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["b", "d"]
        );
        let cursor = first.next_cursor.expect("first page should have a cursor");

        // rows landing before the cursor must not shift the walk
        store.state.create_file(CreateFileRequest {
            tenant_id: TEST_TENANT.to_string(),
            file: mock_file("a", 1),
            enqueue_thumbnails: false,
        })?;
        store.state.create_file(CreateFileRequest {
            tenant_id: TEST_TENANT.to_string(),
            file: mock_file("c", 1),
            enqueue_thumbnails: false,
        })?;

        query.cursor = Some(cursor);
        let second = reader.list_files(&query)?;
        assert_eq!(
            second.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["f", "h"]
        );
        assert!(!second.has_more);
        assert!(second.next_cursor.is_none());
        Ok(())
    }

    #[test]
    fn test_cache_key_scheme() {
        let mut query = FileListQuery::for_vault(VaultId::new("vlt-1".to_string()));
        query.limit = 25;
        query.offset = 50;
        assert_eq!(
            query.cache_key("files"),
            "files:vlt-1:::::created_at:desc:25:50"
        );
        assert!(query.is_cacheable());

        query.search = Some("tax".to_string());
        assert!(!query.is_cacheable());
        query.search = None;
        query.cursor = Some("abc".to_string());
        assert!(!query.is_cacheable());
        query.cursor = None;
        query.trashed = true;
        assert!(!query.is_cacheable());
    }
}
