use anyhow::Result;
use bytes::Bytes;
use data_model::{
    hash_password, FolderBuilder, FolderId, ShareAccess, ShareAccessAction, ShareTarget, Vault,
    VaultError, VaultFile, VaultId,
};
use state_store::{
    requests::{CreateShareRequest, RequestPayload, VaultUpdateRequest},
    scanner::FileListQuery,
};
use vault_utils::get_epoch_time_in_ms;

use crate::{
    listing,
    middleware::TenantContext,
    routes,
    testing::TestService,
    upload::{handle_upload, UploadRequest},
};

const TENANT: &str = "tenant-1";

// 1x1 transparent PNG
const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

fn tenant() -> TenantContext {
    TenantContext {
        tenant_id: TENANT.to_string(),
        user_id: "user-1".to_string(),
    }
}

fn view() -> ShareAccess {
    ShareAccess {
        ip: "198.51.100.4".to_string(),
        user_agent: "integration-test".to_string(),
        at: get_epoch_time_in_ms(),
        action: ShareAccessAction::View,
    }
}

async fn create_vault(test_srv: &TestService, quota_bytes: u64) -> Result<Vault> {
    let vault = Vault::new(TENANT, "test vault", quota_bytes);
    test_srv.service.state.write(VaultUpdateRequest {
        payload: RequestPayload::CreateVault(vault.clone()),
    })?;
    Ok(vault)
}

async fn upload(
    test_srv: &TestService,
    vault_id: &VaultId,
    name: &str,
    data: Vec<u8>,
) -> Result<VaultFile, VaultError> {
    handle_upload(
        &test_srv.service.state,
        &test_srv.service.blob_storage,
        &tenant(),
        test_srv.service.config.max_upload_size_bytes,
        UploadRequest {
            vault_id: vault_id.clone(),
            folder_id: None,
            file_name: name.to_string(),
            data: Bytes::from(data),
        },
    )
    .await
}

#[tokio::test]
async fn test_upload_quota_and_dedup_scenario() -> Result<()> {
    let test_srv = TestService::new().await?;
    let vault = create_vault(&test_srv, 1_000_000).await?;

    let first = upload(&test_srv, &vault.id, "big.bin", vec![0u8; 600_000]).await?;
    assert_eq!(first.size_bytes, 600_000);

    // 600,000 + 500,000 exceeds the 1,000,000 quota
    let err = upload(&test_srv, &vault.id, "too-big.bin", vec![1u8; 500_000])
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::QuotaExceeded { .. }));

    // identical bytes under a different name are rejected without
    // consuming quota or storage
    let err = upload(&test_srv, &vault.id, "copy.bin", vec![0u8; 600_000])
        .await
        .unwrap_err();
    match err {
        VaultError::DuplicateFile {
            existing_file_id,
            existing_file_name,
        } => {
            assert_eq!(existing_file_id, first.id);
            assert_eq!(existing_file_name, "big.bin");
        }
        other => panic!("expected DuplicateFile, got {:?}", other),
    }
    let reader = test_srv.service.state.reader();
    assert_eq!(reader.get_vault(&vault.id, TENANT)?.used_bytes, 600_000);

    // purge frees the quota and the content slot
    test_srv
        .service
        .state
        .trash_files(TENANT, &vault.id, std::slice::from_ref(&first.id))?;
    for key in first.all_storage_keys() {
        test_srv.service.blob_storage.delete(&key).await?;
    }
    let purged = test_srv
        .service
        .state
        .purge_files(&vault.id, std::slice::from_ref(&first.id))?;
    assert_eq!(purged.freed_bytes, 600_000);
    assert_eq!(reader.get_vault(&vault.id, TENANT)?.used_bytes, 0);

    upload(&test_srv, &vault.id, "big.bin", vec![0u8; 600_000]).await?;
    Ok(())
}

#[tokio::test]
async fn test_share_password_and_view_limit_scenario() -> Result<()> {
    let test_srv = TestService::new().await?;
    let vault = create_vault(&test_srv, 1_000_000).await?;
    let file = upload(&test_srv, &vault.id, "secret.txt", b"attack at dawn".to_vec()).await?;

    let share = test_srv.service.state.create_share(CreateShareRequest {
        tenant_id: TENANT.to_string(),
        vault_id: vault.id.clone(),
        target: ShareTarget::File(file.id.clone()),
        password_hash: Some(hash_password("correct horse")),
        expires_at: None,
        download_limit: None,
        view_limit: Some(2),
        bandwidth_limit_bytes: None,
        allow_download: true,
        allow_preview: true,
        allow_upload: false,
    })?;

    // wrong password never reaches the counters
    assert!(!share.verify_password("wrong"));
    assert!(share.verify_password("correct horse"));

    let viewed = test_srv
        .service
        .state
        .record_share_view(&share.short_code, view())?;
    assert_eq!(viewed.views_count, 1);
    let viewed = test_srv
        .service
        .state
        .record_share_view(&share.short_code, view())?;
    assert_eq!(viewed.views_count, 2);

    // third resolve is refused and the counter stays at the limit
    assert!(matches!(
        test_srv
            .service
            .state
            .record_share_view(&share.short_code, view())
            .unwrap_err(),
        VaultError::Gone(_)
    ));
    let share = test_srv
        .service
        .state
        .reader()
        .get_share_by_code(&share.short_code)?
        .unwrap();
    assert_eq!(share.views_count, 2);
    assert_eq!(share.access_log.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_listing_cache_and_trash_visibility() -> Result<()> {
    let test_srv = TestService::new().await?;
    let vault = create_vault(&test_srv, 1_000_000).await?;
    let a = upload(&test_srv, &vault.id, "a.txt", b"alpha".to_vec()).await?;
    upload(&test_srv, &vault.id, "b.txt", b"bravo".to_vec()).await?;

    let reader = test_srv.service.state.reader();
    let cache = &test_srv.service.cache;
    let query = FileListQuery::for_vault(vault.id.clone());

    let page = listing::list_files(&reader, cache, &query).await?;
    assert_eq!(page.total, 2);
    // second read is served from the cache and matches exactly
    let cached = listing::list_files(&reader, cache, &query).await?;
    assert_eq!(cached, page);

    test_srv
        .service
        .state
        .trash_files(TENANT, &vault.id, std::slice::from_ref(&a.id))?;
    listing::invalidate_vault_listings(cache, &vault.id).await;

    let page = listing::list_files(&reader, cache, &query).await?;
    assert_eq!(page.total, 1);
    assert_eq!(page.files[0].name, "b.txt");

    let mut trash_query = query.clone();
    trash_query.trashed = true;
    let trash_page = listing::list_files(&reader, cache, &trash_query).await?;
    assert_eq!(trash_page.total, 1);
    assert_eq!(trash_page.files[0].name, "a.txt");

    test_srv
        .service
        .state
        .restore_files(TENANT, &vault.id, std::slice::from_ref(&a.id))?;
    listing::invalidate_vault_listings(cache, &vault.id).await;
    let page = listing::list_files(&reader, cache, &query).await?;
    assert_eq!(page.total, 2);
    Ok(())
}

#[tokio::test]
async fn test_entity_cache_serves_and_invalidates_files_and_shares() -> Result<()> {
    let test_srv = TestService::new().await?;
    let vault = create_vault(&test_srv, 1_000_000).await?;
    let file = upload(&test_srv, &vault.id, "cached.txt", b"cache me".to_vec()).await?;

    let reader = test_srv.service.state.reader();
    let cache = &test_srv.service.cache;

    let share = test_srv.service.state.create_share(CreateShareRequest {
        tenant_id: TENANT.to_string(),
        vault_id: vault.id.clone(),
        target: ShareTarget::File(file.id.clone()),
        password_hash: None,
        expires_at: None,
        download_limit: None,
        view_limit: None,
        bandwidth_limit_bytes: None,
        allow_download: true,
        allow_preview: true,
        allow_upload: false,
    })?;

    let cached_share = listing::get_share(&reader, cache, &share.short_code)
        .await?
        .unwrap();
    assert_eq!(cached_share.views_count, 0);

    // a counter moved in the store; the cached copy holds until the
    // share's own key is dropped
    test_srv
        .service
        .state
        .record_share_view(&share.short_code, view())?;
    let stale = listing::get_share(&reader, cache, &share.short_code)
        .await?
        .unwrap();
    assert_eq!(stale.views_count, 0);
    listing::invalidate_share(cache, &share.short_code).await;
    let fresh = listing::get_share(&reader, cache, &share.short_code)
        .await?
        .unwrap();
    assert_eq!(fresh.views_count, 1);

    // same contract for the per-file key
    let cached_file = listing::get_file(&reader, cache, &vault.id, &file.id)
        .await?
        .unwrap();
    assert!(!cached_file.is_trashed);
    test_srv
        .service
        .state
        .trash_files(TENANT, &vault.id, std::slice::from_ref(&file.id))?;
    let stale = listing::get_file(&reader, cache, &vault.id, &file.id)
        .await?
        .unwrap();
    assert!(!stale.is_trashed);
    listing::invalidate_file(cache, &vault.id, &file.id).await;
    let fresh = listing::get_file(&reader, cache, &vault.id, &file.id)
        .await?
        .unwrap();
    assert!(fresh.is_trashed);
    Ok(())
}

#[tokio::test]
async fn test_folder_share_resolves_folder_metadata() -> Result<()> {
    let test_srv = TestService::new().await?;
    let vault = create_vault(&test_srv, 1_000_000).await?;

    let folder = FolderBuilder::default()
        .id(FolderId::generate())
        .vault_id(vault.id.clone())
        .parent_id(None)
        .name("quarterly reports".to_string())
        .path("/quarterly reports".to_string())
        .build()?;
    test_srv.service.state.write(VaultUpdateRequest {
        payload: RequestPayload::CreateFolder(folder.clone()),
    })?;

    let share = test_srv.service.state.create_share(CreateShareRequest {
        tenant_id: TENANT.to_string(),
        vault_id: vault.id.clone(),
        target: ShareTarget::Folder(folder.id.clone()),
        password_hash: None,
        expires_at: None,
        download_limit: None,
        view_limit: None,
        bandwidth_limit_bytes: None,
        allow_download: false,
        allow_preview: true,
        allow_upload: false,
    })?;

    let route_state = test_srv.route_state();
    let (file, shared_folder) = routes::shared_payload(&route_state, &share).await?;
    assert!(file.is_none());
    let shared_folder = shared_folder.expect("folder share should expose its folder");
    assert_eq!(shared_folder.name, "quarterly reports");
    assert_eq!(shared_folder.path, "/quarterly reports");
    Ok(())
}

#[tokio::test]
async fn test_asset_pipeline_attaches_thumbnails_and_checksum() -> Result<()> {
    let test_srv = TestService::new().await?;
    let vault = create_vault(&test_srv, 1_000_000).await?;

    let file = upload(&test_srv, &vault.id, "pixel.png", TINY_PNG.to_vec()).await?;
    assert_eq!(file.mime_type, "image/png");
    assert_eq!(file.width, Some(1));
    assert_eq!(file.height, Some(1));
    assert!(file.thumbnails.is_empty());
    assert!(file.checksum_sha256.is_none());

    let reader = test_srv.service.state.reader();
    let cache = &test_srv.service.cache;
    // warm the per-file cache so the worker's invalidation is observable
    let cached = listing::get_file(&reader, cache, &vault.id, &file.id)
        .await?
        .unwrap();
    assert!(cached.thumbnails.is_empty());

    let resolved = test_srv.process_assets().await?;
    assert_eq!(resolved, 1);

    // the worker dropped the stale cached record when it attached assets
    let file = listing::get_file(&reader, cache, &vault.id, &file.id)
        .await?
        .unwrap();
    assert!(file.thumbnails.small.is_some());
    assert!(file.thumbnails.medium.is_some());
    assert!(file.thumbnails.large.is_some());
    assert_eq!(
        file.checksum_sha256.as_deref().map(str::len),
        Some(64),
        "secondary checksum should be a sha-256 hex digest"
    );

    // the variants are durably stored and owned by the record
    for key in file.thumbnails.storage_keys() {
        assert!(!test_srv
            .service
            .blob_storage
            .read_bytes(key)
            .await?
            .is_empty());
    }
    assert!(reader.list_pending_assets(10)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_non_image_upload_skips_thumbnails() -> Result<()> {
    let test_srv = TestService::new().await?;
    let vault = create_vault(&test_srv, 1_000_000).await?;
    let file = upload(&test_srv, &vault.id, "notes.txt", b"plain text".to_vec()).await?;
    assert_eq!(file.mime_type, "text/plain");

    let resolved = test_srv.process_assets().await?;
    assert_eq!(resolved, 1);

    let file = test_srv
        .service
        .state
        .reader()
        .get_file(&vault.id, &file.id)?
        .unwrap();
    assert!(file.thumbnails.is_empty());
    assert!(file.checksum_sha256.is_some());
    Ok(())
}
