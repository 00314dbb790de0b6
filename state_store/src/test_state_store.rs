pub mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use crate::FileVaultState;

    pub struct TestStateStore {
        pub state: Arc<FileVaultState>,
        // drops (and removes) the db dir after the test
        _temp_dir: tempfile::TempDir,
    }

    impl TestStateStore {
        pub fn new() -> Result<TestStateStore> {
            let temp_dir = tempfile::tempdir()?;
            let state = FileVaultState::new(temp_dir.path().join("state"))?;
            Ok(TestStateStore {
                state,
                _temp_dir: temp_dir,
            })
        }
    }
}
