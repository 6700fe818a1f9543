//! Device identifier sources
//!
//! A source yields a stable, device-unique string. The identity alias is
//! derived from it, so a source must return the same value across process
//! restarts.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

/// Primary machine id location on systemd hosts
pub const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// D-Bus fallback location
pub const DBUS_MACHINE_ID_PATH: &str = "/var/lib/dbus/machine-id";

#[derive(Debug, thiserror::Error)]
pub enum DeviceIdError {
    #[error("Device identifier is empty")]
    Empty,

    #[error("No device identifier found (tried {0})")]
    NotFound(String),

    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },
}

/// Supplies this device's identifier.
pub trait DeviceIdSource: Send + Sync {
    fn device_id(&self) -> Result<String, DeviceIdError>;
}

/// Fixed identifier supplied by configuration.
#[derive(Debug, Clone)]
pub struct StaticDeviceId(String);

impl StaticDeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl DeviceIdSource for StaticDeviceId {
    fn device_id(&self) -> Result<String, DeviceIdError> {
        let id = self.0.trim();
        if id.is_empty() {
            return Err(DeviceIdError::Empty);
        }
        Ok(id.to_string())
    }
}

/// Reads the host machine id, trying each path in order.
#[derive(Debug, Clone)]
pub struct MachineIdSource {
    paths: Vec<PathBuf>,
}

impl MachineIdSource {
    pub fn new() -> Self {
        Self::with_paths([MACHINE_ID_PATH, DBUS_MACHINE_ID_PATH])
    }

    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for MachineIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceIdSource for MachineIdSource {
    fn device_id(&self) -> Result<String, DeviceIdError> {
        for path in &self.paths {
            match fs::read_to_string(path) {
                Ok(content) => {
                    let id = content.trim();
                    if id.is_empty() {
                        debug!(path = %path.display(), "Machine id file is empty, trying next");
                        continue;
                    }
                    return Ok(id.to_string());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(DeviceIdError::Read {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        let tried = self
            .paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(DeviceIdError::NotFound(tried))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_static_id_trimmed() {
        let source = StaticDeviceId::new("  abc123\n");
        assert_eq!(source.device_id().unwrap(), "abc123");
    }

    #[test]
    fn test_static_id_empty_rejected() {
        assert!(matches!(
            StaticDeviceId::new("   ").device_id(),
            Err(DeviceIdError::Empty)
        ));
    }

    #[test]
    fn test_machine_id_falls_back() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("machine-id");
        let fallback = dir.path().join("dbus-machine-id");
        fs::write(&fallback, "deadbeef\n").unwrap();

        let source = MachineIdSource::with_paths([primary, fallback]);
        assert_eq!(source.device_id().unwrap(), "deadbeef");
    }

    #[test]
    fn test_machine_id_skips_empty_file() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("machine-id");
        let fallback = dir.path().join("dbus-machine-id");
        fs::write(&primary, "\n").unwrap();
        fs::write(&fallback, "cafe").unwrap();

        let source = MachineIdSource::with_paths([primary, fallback]);
        assert_eq!(source.device_id().unwrap(), "cafe");
    }

    #[test]
    fn test_machine_id_missing_everywhere() {
        let dir = TempDir::new().unwrap();
        let source = MachineIdSource::with_paths([dir.path().join("nope")]);
        assert!(matches!(source.device_id(), Err(DeviceIdError::NotFound(_))));
    }
}
