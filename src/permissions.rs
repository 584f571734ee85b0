//! Time-limited device permissions
//!
//! A grant lets remote clients drive one device type until it expires.
//! Grants are persisted as JSON (by default `~/.nodeflow/permissions.json`)
//! and reloaded at startup. The in-memory table is authoritative: a failed
//! write is logged and the grant still applies for this process.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::device::{DeviceCommand, DeviceType};
use crate::errors::{RelayError, RelayResult};

/// Ten years; longer requests are clamped.
pub const MAX_GRANT_HOURS: f64 = 87_600.0;

/// Identifies the machine a grant was issued on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub platform: String,
    pub username: String,
    pub machine_id: String,
}

impl SystemInfo {
    pub fn current() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .or_else(|| {
                fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self::new(hostname, std::env::consts::OS.to_string(), username)
    }

    pub fn new(hostname: String, platform: String, username: String) -> Self {
        // Persisted, so the digest must not change between builds.
        let machine_id = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(format!("{}-{}-{}", hostname, platform, username).as_bytes());
            hex::encode(hasher.finalize())
        };
        Self {
            hostname,
            platform,
            username,
            machine_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub granted: bool,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub system: SystemInfo,
}

impl PermissionGrant {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.granted && now < self.expires_at
    }
}

/// One row of [`PermissionGate::grants`].
#[derive(Debug, Clone, Serialize)]
pub struct GrantStatus {
    pub device: DeviceType,
    pub granted: bool,
    pub active: bool,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Zero once expired or revoked.
    pub remaining_secs: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PermissionFile {
    #[serde(default)]
    grants: BTreeMap<DeviceType, PermissionGrant>,
}

pub struct PermissionGate {
    path: Option<PathBuf>,
    grants: Mutex<BTreeMap<DeviceType, PermissionGrant>>,
    system: SystemInfo,
}

impl PermissionGate {
    /// Gate persisted at `path`, loading any grants already there.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let grants = load_grants(&path);
        log::info!("Loaded {} permission grant(s) from {:?}", grants.len(), path);
        Self {
            path: Some(path),
            grants: Mutex::new(grants),
            system: SystemInfo::current(),
        }
    }

    /// Gate that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            grants: Mutex::new(BTreeMap::new()),
            system: SystemInfo::current(),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".nodeflow").join("permissions.json"))
    }

    /// Gate at `path`, or at the per-user default. Falls back to memory when
    /// there is no home directory.
    pub fn open(path: Option<&Path>) -> Self {
        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::with_path(path),
            None => {
                log::warn!("No home directory; permissions will not be persisted");
                Self::in_memory()
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceType, PermissionGrant>> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system
    }

    /// Grant `device` for `hours` (fractional allowed), replacing any
    /// earlier grant. Negative or non-finite durations grant nothing usable.
    pub fn grant(&self, device: DeviceType, hours: f64) -> PermissionGrant {
        let millis = if hours.is_finite() && hours > 0.0 {
            (hours.min(MAX_GRANT_HOURS) * 3_600_000.0) as i64
        } else {
            0
        };
        self.grant_for(device, Duration::milliseconds(millis))
    }

    pub fn grant_for(&self, device: DeviceType, duration: Duration) -> PermissionGrant {
        let now = Utc::now();
        let grant = PermissionGrant {
            granted: true,
            granted_at: now,
            expires_at: now + duration,
            system: self.system.clone(),
        };
        let mut grants = self.lock();
        grants.insert(device, grant.clone());
        self.persist(&grants);
        log::info!("Granted {} access until {}", device, grant.expires_at);
        grant
    }

    pub fn check(&self, device: DeviceType) -> bool {
        self.check_at(device, Utc::now())
    }

    pub fn check_at(&self, device: DeviceType, now: DateTime<Utc>) -> bool {
        self.lock()
            .get(&device)
            .map(|g| g.is_valid_at(now))
            .unwrap_or(false)
    }

    /// Returns whether a grant existed. The entry is kept, marked revoked.
    pub fn revoke(&self, device: DeviceType) -> bool {
        let mut grants = self.lock();
        let existed = match grants.get_mut(&device) {
            Some(grant) => {
                grant.granted = false;
                true
            }
            None => false,
        };
        if existed {
            self.persist(&grants);
            log::info!("Revoked {} access", device);
        }
        existed
    }

    /// Parse and authorize a remote device command.
    ///
    /// Unknown commands or devices are `MalformedMessage`; a known pair
    /// without a valid grant is `PermissionDenied`.
    pub fn authorize(&self, command: &str, device: &str) -> RelayResult<(DeviceCommand, DeviceType)> {
        let command: DeviceCommand = command.parse()?;
        let device: DeviceType = device.parse()?;
        if !self.check(device) {
            return Err(RelayError::PermissionDenied(format!(
                "no valid grant for {}",
                device
            )));
        }
        Ok((command, device))
    }

    pub fn validate_command(&self, command: &str, device: &str) -> bool {
        self.authorize(command, device).is_ok()
    }

    pub fn grants(&self) -> Vec<GrantStatus> {
        let now = Utc::now();
        self.lock()
            .iter()
            .map(|(&device, grant)| GrantStatus {
                device,
                granted: grant.granted,
                active: grant.is_valid_at(now),
                granted_at: grant.granted_at,
                expires_at: grant.expires_at,
                remaining_secs: if grant.is_valid_at(now) {
                    (grant.expires_at - now).num_seconds()
                } else {
                    0
                },
            })
            .collect()
    }

    /// Replace the in-memory table with the file's contents.
    pub fn reload(&self) -> RelayResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let loaded = read_file(path)?;
        *self.lock() = loaded.grants;
        Ok(())
    }

    fn persist(&self, grants: &BTreeMap<DeviceType, PermissionGrant>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_file(path, grants) {
            log::error!("Failed to save permissions to {:?}: {}", path, e);
        }
    }
}

fn read_file(path: &Path) -> RelayResult<PermissionFile> {
    if !path.exists() {
        return Ok(PermissionFile::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn load_grants(path: &Path) -> BTreeMap<DeviceType, PermissionGrant> {
    match read_file(path) {
        Ok(file) => file.grants,
        Err(e) => {
            log::warn!("Ignoring unreadable permission file {:?}: {}", path, e);
            BTreeMap::new()
        }
    }
}

fn write_file(path: &Path, grants: &BTreeMap<DeviceType, PermissionGrant>) -> RelayResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    #[derive(Serialize)]
    struct Borrowed<'a> {
        grants: &'a BTreeMap<DeviceType, PermissionGrant>,
    }
    let json = serde_json::to_string_pretty(&Borrowed { grants })?;
    fs::write(path, json)?;
    Ok(())
}
