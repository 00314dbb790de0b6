pub mod vault_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub uploads: Counter<u64>,
        pub upload_bytes: Counter<u64>,
        pub duplicate_uploads: Counter<u64>,
        pub share_views: Counter<u64>,
        pub share_downloads: Counter<u64>,
        pub purged_files: Counter<u64>,
        pub purged_bytes: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("vault-server");
            let uploads = meter
                .u64_counter("vault.server.uploads")
                .with_description("number of successful uploads")
                .build();
            let upload_bytes = meter
                .u64_counter("vault.server.upload_bytes")
                .with_description("number of bytes accepted by uploads")
                .build();
            let duplicate_uploads = meter
                .u64_counter("vault.server.duplicate_uploads")
                .with_description("number of uploads rejected as duplicate content")
                .build();
            let share_views = meter
                .u64_counter("vault.server.share_views")
                .with_description("number of public share resolves")
                .build();
            let share_downloads = meter
                .u64_counter("vault.server.share_downloads")
                .with_description("number of authorized share downloads")
                .build();
            let purged_files = meter
                .u64_counter("vault.server.purged_files")
                .with_description("number of hard-deleted files")
                .build();
            let purged_bytes = meter
                .u64_counter("vault.server.purged_bytes")
                .with_description("number of bytes reclaimed by purges")
                .build();
            Metrics {
                uploads,
                upload_bytes,
                duplicate_uploads,
                share_views,
                share_downloads,
                purged_files,
                purged_bytes,
            }
        }
    }
}

pub mod cache_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub hits: Counter<u64>,
        pub misses: Counter<u64>,
        pub errors: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("vault-server");
            let hits = meter
                .u64_counter("vault.cache.hits")
                .with_description("cache hits across both tiers")
                .build();
            let misses = meter
                .u64_counter("vault.cache.misses")
                .with_description("cache misses")
                .build();
            let errors = meter
                .u64_counter("vault.cache.errors")
                .with_description("shared cache backend failures and timeouts")
                .build();
            Metrics {
                hits,
                misses,
                errors,
            }
        }
    }
}
