pub mod tests {
    use crate::{
        Share, ShareBuilder, ShareTarget, Vault, VaultFile, VaultFileBuilder, FileId, VaultId,
    };

    pub const TEST_TENANT: &str = "tenant-1";
    pub const TEST_USER: &str = "user-1";

    pub fn mock_vault() -> Vault {
        Vault {
            id: VaultId::new("vlt-test".to_string()),
            tenant_id: TEST_TENANT.to_string(),
            name: "test vault".to_string(),
            quota_bytes: 1_000_000,
            used_bytes: 0,
            created_at: 0,
        }
    }

    pub fn mock_file(name: &str, size_bytes: u64) -> VaultFile {
        let checksum = blake3_hex(name.as_bytes());
        VaultFileBuilder::default()
            .id(FileId::generate())
            .vault_id(VaultId::new("vlt-test".to_string()))
            .name(name.to_string())
            .path(format!("/{}", name))
            .storage_key(format!("vlt-test/{}", name))
            .mime_type("application/octet-stream".to_string())
            .size_bytes(size_bytes)
            .checksum(checksum)
            .owner(TEST_USER.to_string())
            .build()
            .unwrap()
    }

    pub fn mock_share() -> Share {
        ShareBuilder::default()
            .id(crate::ShareId::generate())
            .vault_id(VaultId::new("vlt-test".to_string()))
            .target(ShareTarget::File(FileId::new("fil-test".to_string())))
            .short_code(Share::generate_short_code())
            .build()
            .unwrap()
    }

    // Stand-in checksum so mock files don't need real payloads.
    fn blake3_hex(data: &[u8]) -> String {
        let mut out = String::new();
        for b in data.iter().take(16) {
            out.push_str(&format!("{:02x}", b));
        }
        format!("mock-{}", out)
    }
}
