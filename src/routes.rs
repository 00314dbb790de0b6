use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use blob_store::{BlobStorage, LocalUrlSigner};
use cache::CacheLayer;
use data_model::{
    hash_password, FileId, FolderBuilder, FolderId, ShareAccessAction, ShareTarget, Vault,
    VaultError, VaultId,
};
use metrics::vault_stats;
use state_store::{
    requests::{CreateShareRequest, RequestPayload, VaultUpdateRequest},
    scanner::{FileListQuery, FileSortField, SortOrder},
    FileVaultState,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use vault_utils::get_epoch_time_in_ms;

use crate::{
    config::ServerConfig,
    http_objects::{
        ApiError, CreateFolder, CreateShare, CreateVault, FileListResponse, FileMetadata,
        FileSelection, FolderResponse, ListFilesParams, Pagination, PurgeParams, PurgeResponse,
        RestoreResponse, ShareAccessBody, ShareDownloadResponse, SharePublicResponse,
        ShareResponse, SharedFile, SharedFolder, SignedBlobParams, TrashResponse, UploadForm,
        UploadResponse, VaultResponse,
    },
    listing,
    middleware::{ClientInfo, TenantContext},
    upload::{handle_upload, UploadRequest},
};

#[derive(OpenApi)]
#[openapi(
        paths(
            create_vault,
            get_vault,
            create_folder,
            list_files,
            upload_file,
            trash_files,
            create_share,
            resolve_share,
            access_share,
            restore_files,
            purge_files,
        ),
        components(
            schemas(
                ApiError,
                CreateVault,
                VaultResponse,
                CreateFolder,
                FolderResponse,
                FileMetadata,
                FileListResponse,
                UploadResponse,
                CreateShare,
                ShareResponse,
                SharePublicResponse,
                SharedFile,
                SharedFolder,
                ShareAccessBody,
                ShareDownloadResponse,
                FileSelection,
                TrashResponse,
                RestoreResponse,
                PurgeResponse,
            )
        ),
        tags(
            (name = "vault", description = "File Vault API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub config: Arc<ServerConfig>,
    pub state: Arc<FileVaultState>,
    pub blob_storage: Arc<BlobStorage>,
    pub cache: Arc<CacheLayer>,
    pub local_signer: LocalUrlSigner,
    pub metrics: Arc<vault_stats::Metrics>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    let max_body = route_state.config.max_upload_size_bytes as usize + 1024 * 1024;
    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route("/vaults", post(create_vault).with_state(route_state.clone()))
        .route(
            "/vaults/{id}",
            get(get_vault).with_state(route_state.clone()),
        )
        .route(
            "/folders",
            post(create_folder).with_state(route_state.clone()),
        )
        .route(
            "/files",
            get(list_files)
                .delete(trash_files)
                .with_state(route_state.clone()),
        )
        .route("/upload", post(upload_file).with_state(route_state.clone()))
        .route("/shares", post(create_share).with_state(route_state.clone()))
        .route(
            "/share/{code}",
            get(resolve_share)
                .post(access_share)
                .with_state(route_state.clone()),
        )
        .route(
            "/trash",
            post(restore_files)
                .delete(purge_files)
                .with_state(route_state.clone()),
        )
        .route(
            "/blobs/{*key}",
            get(serve_signed_blob).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();
                    tracing::debug_span!("request", %method, %uri)
                })
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_body))
}

async fn index() -> &'static str {
    "File Vault Server"
}

#[utoipa::path(
    post,
    path = "/vaults",
    request_body = CreateVault,
    tag = "vault",
    responses(
        (status = 201, description = "Vault created", body = VaultResponse),
        (status = 400, description = "Invalid request", body = ApiError),
    ),
)]
async fn create_vault(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Json(payload): Json<CreateVault>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.name.is_empty() {
        return Err(ApiError::bad_request("vault name is required"));
    }
    if payload.quota_bytes == 0 {
        return Err(ApiError::bad_request("quota_bytes must be positive"));
    }
    let vault = Vault::new(&tenant.tenant_id, &payload.name, payload.quota_bytes);
    state.state.write(VaultUpdateRequest {
        payload: RequestPayload::CreateVault(vault.clone()),
    })?;
    Ok((StatusCode::CREATED, Json(VaultResponse::from(vault))))
}

#[utoipa::path(
    get,
    path = "/vaults/{id}",
    tag = "vault",
    responses(
        (status = 200, description = "Vault details", body = VaultResponse),
        (status = 404, description = "Vault not found", body = ApiError),
    ),
)]
async fn get_vault(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Path(id): Path<String>,
) -> Result<Json<VaultResponse>, ApiError> {
    let vault = state
        .state
        .reader()
        .get_vault(&VaultId::new(id), &tenant.tenant_id)?;
    Ok(Json(VaultResponse::from(vault)))
}

#[utoipa::path(
    post,
    path = "/folders",
    request_body = CreateFolder,
    tag = "vault",
    responses(
        (status = 201, description = "Folder created", body = FolderResponse),
        (status = 404, description = "Vault not found", body = ApiError),
    ),
)]
async fn create_folder(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Json(payload): Json<CreateFolder>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.name.is_empty() {
        return Err(ApiError::bad_request("folder name is required"));
    }
    let vault_id = VaultId::new(payload.vault_id);
    let reader = state.state.reader();
    reader.get_vault(&vault_id, &tenant.tenant_id)?;
    let parent_id = payload.parent_id.map(FolderId::new);
    let parent_path = match &parent_id {
        Some(parent) => {
            reader
                .get_folder(&vault_id, parent)?
                .ok_or_else(|| ApiError::not_found("parent folder not found"))?
                .path
        }
        None => String::new(),
    };
    let folder = FolderBuilder::default()
        .id(FolderId::generate())
        .vault_id(vault_id.clone())
        .parent_id(parent_id)
        .name(payload.name.clone())
        .path(format!("{}/{}", parent_path, payload.name))
        .build()
        .map_err(|e| ApiError::internal_error(anyhow::Error::new(e)))?;
    state.state.write(VaultUpdateRequest {
        payload: RequestPayload::CreateFolder(folder.clone()),
    })?;
    listing::invalidate_vault_listings(&state.cache, &vault_id).await;
    Ok((StatusCode::CREATED, Json(FolderResponse::from(folder))))
}

fn build_list_query(params: ListFilesParams) -> Result<FileListQuery, ApiError> {
    let mut query = FileListQuery::for_vault(VaultId::new(params.vault_id));
    query.folder_id = params.folder_id.map(FolderId::new);
    query.search = params.search;
    query.mime_type = params.mime_type;
    query.extension = params.extension;
    query.min_size_bytes = params.min_size_bytes;
    query.max_size_bytes = params.max_size_bytes;
    query.created_after = params.created_after;
    query.created_before = params.created_before;
    query.sort_by = match params.sort_by.as_deref() {
        None | Some("created_at") => FileSortField::CreatedAt,
        Some("name") => FileSortField::Name,
        Some("size_bytes") => FileSortField::SizeBytes,
        Some("updated_at") => FileSortField::UpdatedAt,
        Some(other) => {
            return Err(ApiError::bad_request(&format!(
                "unknown sort field: {}",
                other
            )))
        }
    };
    query.sort_order = match params.sort_order.as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => {
            return Err(ApiError::bad_request(&format!(
                "unknown sort order: {}",
                other
            )))
        }
    };
    query.limit = params.limit.unwrap_or(50).clamp(1, 1000);
    query.offset = params.offset.unwrap_or(0);
    query.cursor = params.cursor;
    query.trashed = params.trashed.unwrap_or(false);
    query.include_deleted = params.include_deleted.unwrap_or(false);
    Ok(query)
}

#[utoipa::path(
    get,
    path = "/files",
    tag = "vault",
    params(ListFilesParams),
    responses(
        (status = 200, description = "File listing", body = FileListResponse),
        (status = 404, description = "Vault not found", body = ApiError),
    ),
)]
async fn list_files(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Query(params): Query<ListFilesParams>,
) -> Result<Json<FileListResponse>, ApiError> {
    let query = build_list_query(params)?;
    let reader = state.state.reader();
    reader.get_vault(&query.vault_id, &tenant.tenant_id)?;
    let page = listing::list_files(&reader, &state.cache, &query).await?;
    Ok(Json(FileListResponse {
        pagination: Pagination {
            total: page.total,
            limit: query.limit,
            offset: query.offset,
            has_more: page.has_more,
            next_cursor: page.next_cursor,
        },
        files: page.files.into_iter().map(FileMetadata::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/upload",
    tag = "vault",
    request_body(content_type = "multipart/form-data", content = inline(UploadForm)),
    responses(
        (status = 201, description = "File stored", body = UploadResponse),
        (status = 400, description = "Size, quota or validation failure", body = ApiError),
        (status = 409, description = "Duplicate content", body = ApiError),
    ),
)]
async fn upload_file(
    State(state): State<RouteState>,
    tenant: TenantContext,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut vault_id: Option<String> = None;
    let mut folder_id: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut data: Option<bytes::Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(&e.to_string()))?
    {
        match field.name() {
            Some("file") => {
                file_name = field.file_name().map(|n| n.to_string());
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(&e.to_string()))?,
                );
            }
            Some("vault_id") => {
                vault_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(&e.to_string()))?,
                );
            }
            Some("folder_id") => {
                folder_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(&e.to_string()))?,
                );
            }
            _ => {}
        }
    }
    let vault_id =
        VaultId::new(vault_id.ok_or_else(|| ApiError::bad_request("vault_id is required"))?);
    let data = data.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    let file_name = file_name.ok_or_else(|| ApiError::bad_request("file name is required"))?;

    let request = UploadRequest {
        vault_id: vault_id.clone(),
        folder_id: folder_id.filter(|f| !f.is_empty()).map(FolderId::new),
        file_name,
        data,
    };
    let result = handle_upload(
        &state.state,
        &state.blob_storage,
        &tenant,
        state.config.max_upload_size_bytes,
        request,
    )
    .await;
    match result {
        Ok(file) => {
            state.metrics.uploads.add(1, &[]);
            state.metrics.upload_bytes.add(file.size_bytes, &[]);
            listing::invalidate_vault_listings(&state.cache, &vault_id).await;
            Ok((StatusCode::CREATED, Json(UploadResponse::from(file))))
        }
        Err(VaultError::DuplicateFile {
            existing_file_id, ..
        }) => {
            state.metrics.duplicate_uploads.add(1, &[]);
            let existing = state
                .state
                .reader()
                .get_file(&vault_id, &existing_file_id)?;
            let mut api_error = ApiError::from(VaultError::DuplicateFile {
                existing_file_id,
                existing_file_name: String::new(),
            });
            if let Some(existing) = existing {
                api_error = api_error.with_existing_file(FileMetadata::from(existing));
            }
            Err(api_error)
        }
        Err(e) => Err(e.into()),
    }
}

#[utoipa::path(
    delete,
    path = "/files",
    tag = "vault",
    request_body = FileSelection,
    responses(
        (status = 200, description = "Files moved to trash", body = TrashResponse),
        (status = 404, description = "Vault or file not found", body = ApiError),
    ),
)]
async fn trash_files(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Json(payload): Json<FileSelection>,
) -> Result<Json<TrashResponse>, ApiError> {
    let vault_id = VaultId::new(payload.vault_id);
    let file_ids: Vec<FileId> = payload.file_ids.into_iter().map(FileId::new).collect();
    let trashed = state
        .state
        .trash_files(&tenant.tenant_id, &vault_id, &file_ids)?;
    listing::invalidate_vault_listings(&state.cache, &vault_id).await;
    for file in &trashed {
        listing::invalidate_file(&state.cache, &vault_id, &file.id).await;
    }
    Ok(Json(TrashResponse {
        trashed_count: trashed.len(),
        trashed_files: trashed.into_iter().map(FileMetadata::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/shares",
    tag = "vault",
    request_body = CreateShare,
    responses(
        (status = 201, description = "Share created", body = ShareResponse),
        (status = 409, description = "Short code space exhausted", body = ApiError),
    ),
)]
async fn create_share(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Json(payload): Json<CreateShare>,
) -> Result<impl IntoResponse, ApiError> {
    let vault_id = VaultId::new(payload.vault_id);
    let reader = state.state.reader();
    reader.get_vault(&vault_id, &tenant.tenant_id)?;

    let target = match (&payload.file_id, &payload.folder_id) {
        (Some(file_id), None) => {
            let file_id = FileId::new(file_id.clone());
            let file = reader
                .get_file(&vault_id, &file_id)?
                .filter(|f| !f.is_trashed)
                .ok_or_else(|| ApiError::not_found("file not found"))?;
            ShareTarget::File(file.id)
        }
        (None, Some(folder_id)) => {
            let folder_id = FolderId::new(folder_id.clone());
            reader
                .get_folder(&vault_id, &folder_id)?
                .ok_or_else(|| ApiError::not_found("folder not found"))?;
            ShareTarget::Folder(folder_id)
        }
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of file_id or folder_id is required",
            ))
        }
    };

    let share = state.state.create_share(CreateShareRequest {
        tenant_id: tenant.tenant_id.clone(),
        vault_id,
        target,
        password_hash: payload.password.as_deref().map(hash_password),
        expires_at: payload.expires_at,
        download_limit: payload.download_limit,
        view_limit: payload.view_limit,
        bandwidth_limit_bytes: payload.bandwidth_limit_bytes,
        allow_download: payload.allow_download,
        allow_preview: payload.allow_preview,
        allow_upload: payload.allow_upload,
    })?;
    let share_url = format!(
        "{}/share/{}",
        state.config.api_base_url.trim_end_matches('/'),
        share.short_code
    );
    Ok((
        StatusCode::CREATED,
        Json(ShareResponse::from_share(share, share_url)),
    ))
}

/// Resolves the target behind a share link into its public payload:
/// file metadata for file shares, folder name and path for folder
/// shares. Trashed files read as absent.
pub(crate) async fn shared_payload(
    state: &RouteState,
    share: &data_model::Share,
) -> Result<(Option<SharedFile>, Option<SharedFolder>), VaultError> {
    match &share.target {
        ShareTarget::File(file_id) => {
            let file =
                listing::get_file(&state.state.reader(), &state.cache, &share.vault_id, file_id)
                    .await?
                    .filter(|f| !f.is_trashed);
            Ok((file.as_ref().map(SharedFile::from), None))
        }
        ShareTarget::Folder(folder_id) => {
            let folder = state.state.reader().get_folder(&share.vault_id, folder_id)?;
            Ok((
                None,
                folder.map(|f| SharedFolder {
                    name: f.name,
                    path: f.path,
                }),
            ))
        }
    }
}

#[utoipa::path(
    get,
    path = "/share/{code}",
    tag = "vault",
    responses(
        (status = 200, description = "Share metadata", body = SharePublicResponse),
        (status = 404, description = "Unknown or deactivated share", body = ApiError),
        (status = 410, description = "Share expired or over its view limit", body = ApiError),
    ),
)]
async fn resolve_share(
    State(state): State<RouteState>,
    client: ClientInfo,
    Path(code): Path<String>,
) -> Result<Json<SharePublicResponse>, ApiError> {
    let share = state
        .state
        .record_share_view(&code, client.access(ShareAccessAction::View))?;
    state.metrics.share_views.add(1, &[]);
    listing::invalidate_share(&state.cache, &code).await;
    let (file, folder) = if share.has_password() {
        (None, None)
    } else {
        shared_payload(&state, &share).await?
    };
    Ok(Json(SharePublicResponse {
        short_code: share.short_code,
        requires_password: share.password_hash.is_some(),
        allow_download: share.allow_download,
        allow_preview: share.allow_preview,
        file,
        folder,
    }))
}

#[utoipa::path(
    post,
    path = "/share/{code}",
    tag = "vault",
    request_body = ShareAccessBody,
    responses(
        (status = 200, description = "Verified metadata or download grant", body = ShareDownloadResponse),
        (status = 401, description = "Password missing or incorrect", body = ApiError),
        (status = 410, description = "Share expired or over a limit", body = ApiError),
    ),
)]
async fn access_share(
    State(state): State<RouteState>,
    client: ClientInfo,
    Path(code): Path<String>,
    Json(payload): Json<ShareAccessBody>,
) -> Result<axum::response::Response, ApiError> {
    let share = listing::get_share(&state.state.reader(), &state.cache, &code)
        .await?
        .ok_or_else(|| ApiError::not_found("share not found"))?;
    // Password verification happens before any counter moves, so a bad
    // password is never charged against the share's limits.
    if !share.verify_password(payload.password.as_deref().unwrap_or_default()) {
        return Err(VaultError::ShareUnauthorized.into());
    }

    if payload.action.as_deref() == Some("download") {
        let (_share, file) = state
            .state
            .authorize_share_download(&code, client.access(ShareAccessAction::Download))?;
        state.metrics.share_downloads.add(1, &[]);
        listing::invalidate_share(&state.cache, &code).await;
        let download_url = signed_download_url(&state, &file.storage_key).await?;
        return Ok(Json(ShareDownloadResponse {
            download_url,
            file_name: file.name,
            mime_type: file.mime_type,
            size_bytes: file.size_bytes,
        })
        .into_response());
    }

    let share = state
        .state
        .record_share_view(&code, client.access(ShareAccessAction::View))?;
    state.metrics.share_views.add(1, &[]);
    listing::invalidate_share(&state.cache, &code).await;
    let (file, folder) = shared_payload(&state, &share).await?;
    Ok(Json(SharePublicResponse {
        short_code: share.short_code,
        requires_password: share.password_hash.is_some(),
        allow_download: share.allow_download,
        allow_preview: share.allow_preview,
        file,
        folder,
    })
    .into_response())
}

/// Native presign when the backing store supports it, local HMAC URL
/// otherwise. Only called after a download has been authorized.
async fn signed_download_url(state: &RouteState, key: &str) -> Result<String, VaultError> {
    let ttl = Duration::from_secs(state.config.signed_url_ttl_secs);
    if let Some(url) = state.blob_storage.presigned_url(key, ttl).await? {
        return Ok(url);
    }
    Ok(state
        .local_signer
        .sign(key, get_epoch_time_in_ms() / 1000, ttl))
}

#[utoipa::path(
    post,
    path = "/trash",
    tag = "vault",
    request_body = FileSelection,
    responses(
        (status = 200, description = "Files restored from trash", body = RestoreResponse),
        (status = 404, description = "Vault or file not found", body = ApiError),
    ),
)]
async fn restore_files(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Json(payload): Json<FileSelection>,
) -> Result<Json<RestoreResponse>, ApiError> {
    let vault_id = VaultId::new(payload.vault_id);
    let file_ids: Vec<FileId> = payload.file_ids.into_iter().map(FileId::new).collect();
    let restored = state
        .state
        .restore_files(&tenant.tenant_id, &vault_id, &file_ids)?;
    listing::invalidate_vault_listings(&state.cache, &vault_id).await;
    for file in &restored {
        listing::invalidate_file(&state.cache, &vault_id, &file.id).await;
    }
    Ok(Json(RestoreResponse {
        restored_count: restored.len(),
        restored_files: restored.into_iter().map(FileMetadata::from).collect(),
    }))
}

#[utoipa::path(
    delete,
    path = "/trash",
    tag = "vault",
    params(PurgeParams),
    responses(
        (status = 200, description = "Trash purged", body = PurgeResponse),
        (status = 404, description = "Vault not found", body = ApiError),
    ),
)]
async fn purge_files(
    State(state): State<RouteState>,
    tenant: TenantContext,
    Query(params): Query<PurgeParams>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let vault_id = VaultId::new(params.vault_id);
    let reader = state.state.reader();
    reader.get_vault(&vault_id, &tenant.tenant_id)?;

    // explicit ids, or everything currently in the trash
    let candidates: Vec<FileId> = match params.file_ids {
        Some(ids) => ids
            .split(',')
            .filter(|id| !id.is_empty())
            .map(FileId::from)
            .collect(),
        None => {
            let mut query = FileListQuery::for_vault(vault_id.clone());
            query.trashed = true;
            query.limit = usize::MAX;
            reader
                .list_files(&query)?
                .files
                .into_iter()
                .map(|f| f.id)
                .collect()
        }
    };

    let mut errors = Vec::new();
    let mut purgeable = Vec::new();
    for file_id in candidates {
        let Some(file) = reader.get_file(&vault_id, &file_id)? else {
            continue;
        };
        if !file.is_trashed {
            continue;
        }
        let mut blob_failure = None;
        for key in file.all_storage_keys() {
            if let Err(e) = state.blob_storage.delete(&key).await {
                blob_failure = Some(format!("{}: failed to delete blob: {}", file.id, e));
                break;
            }
        }
        match blob_failure {
            Some(message) => errors.push(message),
            None => purgeable.push(file_id),
        }
    }

    let result = state.state.purge_files(&vault_id, &purgeable)?;
    state.metrics.purged_files.add(result.purged.len() as u64, &[]);
    state.metrics.purged_bytes.add(result.freed_bytes, &[]);
    listing::invalidate_vault_listings(&state.cache, &vault_id).await;
    for file in &result.purged {
        listing::invalidate_file(&state.cache, &vault_id, &file.id).await;
    }
    Ok(Json(PurgeResponse {
        deleted_count: result.purged.len(),
        freed_bytes: result.freed_bytes,
        errors,
    }))
}

/// Serves blobs for locally signed URLs on deployments whose backend
/// cannot presign. The signature covers the exact key and expiry.
async fn serve_signed_blob(
    State(state): State<RouteState>,
    Path(key): Path<String>,
    Query(params): Query<SignedBlobParams>,
) -> Result<axum::response::Response, ApiError> {
    let now_secs = get_epoch_time_in_ms() / 1000;
    if !state
        .local_signer
        .verify(&key, params.expires, &params.sig, now_secs)
    {
        return Err(ApiError::unauthorized("invalid or expired signature"));
    }
    let stream = state
        .blob_storage
        .get(&key)
        .await
        .map_err(ApiError::internal_error)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}
