use std::sync::Arc;

use blob_store::BlobStorage;
use bytes::Bytes;
use data_model::{
    FileId, FolderId, VaultError, VaultFile, VaultFileBuilder, VaultId,
};
use nanoid::nanoid;
use state_store::{requests::CreateFileRequest, FileVaultState};
use tracing::{error, info};

use crate::{middleware::TenantContext, sniff};

pub struct UploadRequest {
    pub vault_id: VaultId,
    pub folder_id: Option<FolderId>,
    pub file_name: String,
    pub data: Bytes,
}

/// Runs the upload pipeline: size and quota prechecks, content sniffing,
/// dedup, durable blob write, then the atomic record commit. The blob is
/// rolled back if the commit loses a race (duplicate or quota).
pub async fn handle_upload(
    state: &Arc<FileVaultState>,
    storage: &Arc<BlobStorage>,
    tenant: &TenantContext,
    max_upload_size_bytes: u64,
    request: UploadRequest,
) -> Result<VaultFile, VaultError> {
    let size_bytes = request.data.len() as u64;
    if request.file_name.is_empty() {
        return Err(VaultError::Validation("file name is required".to_string()));
    }
    if size_bytes == 0 {
        return Err(VaultError::Validation("file is empty".to_string()));
    }
    if size_bytes > max_upload_size_bytes {
        return Err(VaultError::Validation(format!(
            "file exceeds the maximum upload size of {} bytes",
            max_upload_size_bytes
        )));
    }

    let reader = state.reader();
    let vault = reader.get_vault(&request.vault_id, &tenant.tenant_id)?;

    let (mime_type, extension) = sniff::resolve(&request.data, &request.file_name);
    let dimensions = sniff::dimensions(&request.data);
    let checksum = blake3::hash(&request.data).to_hex().to_string();

    // Cheap dedup probe to avoid a doomed blob write; not authoritative.
    // Duplicates are reported before the quota is consulted since they
    // never consume quota.
    if let Some(existing) = reader.find_file_by_checksum(&request.vault_id, &checksum)? {
        return Err(VaultError::DuplicateFile {
            existing_file_id: existing.id,
            existing_file_name: existing.name,
        });
    }

    // Precheck before touching storage; the commit re-checks under lock.
    if size_bytes > vault.available_bytes() {
        return Err(VaultError::QuotaExceeded {
            used_bytes: vault.used_bytes,
            incoming_bytes: size_bytes,
            quota_bytes: vault.quota_bytes,
        });
    }
    let folder_path = match &request.folder_id {
        Some(folder_id) => {
            let folder = reader
                .get_folder(&request.vault_id, folder_id)?
                .ok_or(VaultError::NotFound("folder"))?;
            folder.path
        }
        None => String::new(),
    };

    let folder_segment = request
        .folder_id
        .as_ref()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "root".to_string());
    let blob_key = format!(
        "{}_{}_{}_{}",
        request.vault_id,
        folder_segment,
        request.file_name,
        nanoid!(8)
    );
    let put_result = storage.put_bytes(&blob_key, request.data).await?;

    let is_image = mime_type.starts_with("image/");
    let file = VaultFileBuilder::default()
        .id(FileId::generate())
        .vault_id(request.vault_id.clone())
        .folder_id(request.folder_id.clone())
        .name(request.file_name.clone())
        .path(format!("{}/{}", folder_path, request.file_name))
        .storage_key(put_result.key.clone())
        .mime_type(mime_type)
        .size_bytes(size_bytes)
        .extension(extension)
        .checksum(checksum)
        .width(dimensions.map(|d| d.width))
        .height(dimensions.map(|d| d.height))
        .owner(tenant.user_id.clone())
        .build()
        .map_err(|e| VaultError::Internal(anyhow::Error::new(e)))?;

    let committed = state.create_file(CreateFileRequest {
        tenant_id: tenant.tenant_id.clone(),
        file,
        enqueue_thumbnails: is_image,
    });
    match committed {
        Ok(file) => {
            info!(
                vault_id = %file.vault_id,
                file_id = %file.id,
                size_bytes,
                "upload committed"
            );
            Ok(file)
        }
        Err(e) => {
            // A concurrent upload won the vault lock; the blob is ours to
            // clean up.
            if let Err(delete_err) = storage.delete(&put_result.key).await {
                error!(
                    key = %put_result.key,
                    "failed to roll back blob after rejected upload: {:?}",
                    delete_err
                );
            }
            Err(e)
        }
    }
}
