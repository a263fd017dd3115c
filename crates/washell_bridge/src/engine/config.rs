use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use washell_config::ShellConfig;

/// I/O and environment configuration for the engine's WASI-style layer.
///
/// The guest's own command line goes through the init export, not through
/// WASI argv; this struct only covers the OS-shim surface.
#[derive(Clone, Default)]
pub struct WasiConfig {
    /// Environment seeded into the guest at shell init, in order.
    pub env: Vec<(String, String)>,
    /// Preopened directory for guest file access.
    pub preopened_dir: Option<PathBuf>,
    /// Capture stdout into this buffer when set; inherit the process stream
    /// otherwise.
    pub stdout: Option<Arc<RwLock<Vec<u8>>>>,
    /// Capture stderr into this buffer when set.
    pub stderr: Option<Arc<RwLock<Vec<u8>>>>,
}

impl WasiConfig {
    pub fn create_from_shell_config(config: &ShellConfig) -> Self {
        Self {
            env: config
                .app
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            preopened_dir: config.app.preopened_dir.clone(),
            stdout: None,
            stderr: None,
        }
    }
}
