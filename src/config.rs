//! Connection settings and their environment overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{LinkError, Result};
use crate::framing::{DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_BUFFER_SIZE};
use crate::transport::{Endpoint, ProcessSpec};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 55557;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Batches routinely run for minutes on the editor side.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(120_000);

pub const HOST_ENV: &str = "EDITORLINK_HOST";
pub const PORT_ENV: &str = "EDITORLINK_PORT";
pub const TIMEOUT_ENV: &str = "EDITORLINK_TIMEOUT_MS";
pub const BATCH_TIMEOUT_ENV: &str = "EDITORLINK_BATCH_TIMEOUT_MS";
pub const SIDECAR_ENV: &str = "EDITORLINK_SIDECAR";

/// Sidecar executable name, looked up on PATH as a last resort.
#[cfg(windows)]
const SIDECAR_EXE: &str = "UnrealMCP.Sidecar.exe";
#[cfg(not(windows))]
const SIDECAR_EXE: &str = "UnrealMCP.Sidecar";

#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for ordinary calls.
    pub timeout: Duration,
    /// Deadline for a whole batch.
    pub batch_timeout: Duration,
    /// Greedy variant: bytes accumulated before a reply is abandoned.
    pub max_buffer_size: usize,
    /// Content-Length variant: largest accepted body.
    pub max_body_size: usize,
    pub sidecar_path: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            sidecar_path: default_sidecar_path(),
        }
    }
}

impl LinkConfig {
    /// Defaults with `EDITORLINK_*` environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Config` if an override is set but unparsable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = lookup(PORT_ENV) {
            config.port = parse_var(PORT_ENV, &port)?;
        }
        if let Some(ms) = lookup(TIMEOUT_ENV) {
            config.timeout = Duration::from_millis(parse_var(TIMEOUT_ENV, &ms)?);
        }
        if let Some(ms) = lookup(BATCH_TIMEOUT_ENV) {
            config.batch_timeout = Duration::from_millis(parse_var(BATCH_TIMEOUT_ENV, &ms)?);
        }
        if let Some(path) = lookup(SIDECAR_ENV).filter(|p| !p.is_empty()) {
            config.sidecar_path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(LinkError::Config("port must be non-zero".to_string()));
        }
        if self.timeout.is_zero() || self.batch_timeout.is_zero() {
            return Err(LinkError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// The editor's raw command socket.
    pub fn editor_endpoint(&self) -> Endpoint {
        Endpoint::Tcp {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// How to launch the sidecar so it proxies to this config's editor.
    pub fn sidecar_spec(&self) -> ProcessSpec {
        ProcessSpec::new(&self.sidecar_path)
            .arg("--ue-host")
            .arg(&self.host)
            .arg("--ue-port")
            .arg(self.port.to_string())
            .arg("--timeout-ms")
            .arg(self.timeout.as_millis().to_string())
            .env("UNREAL_MCP_LOG_JSON", "1")
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LinkError::Config(format!("{}={:?}: {}", key, value, e)))
}

/// Resolve the sidecar executable.
///
/// Lookup order:
/// 1. `EDITORLINK_SIDECAR` environment variable
/// 2. `<data_local_dir>/editorlink/<exe>` if installed there
/// 3. Bare executable name (PATH lookup at spawn time)
pub fn default_sidecar_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SIDECAR_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }

    if let Some(data_dir) = dirs::data_local_dir() {
        let installed = data_dir.join("editorlink").join(SIDECAR_EXE);
        if installed.exists() {
            info!("Using installed sidecar: {}", installed.display());
            return installed;
        }
    }

    PathBuf::from(SIDECAR_EXE)
}
