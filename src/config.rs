use std::path::PathBuf;

/// Tunables consumed by the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Location handed to the persistence collaborator at initialize time.
    pub path: PathBuf,
    /// Ceiling on the number of segments the table may grow to.
    pub max_loaded_segments: u32,
    /// Attempt budget for bounded slot-lock acquisition.
    pub lock_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera-data"),
            max_loaded_segments: 256,
            lock_attempts: 100,
        }
    }
}
