//! Helper configuration.
//!
//! Every field has a default, so an absent or empty file yields a working
//! helper. Example:
//!
//! ```toml
//! service_name = "io.diskgate.helper"
//! runtime_dir = "/var/run"
//! callback_timeout_secs = 30
//! internal_sd_policy = "allow"
//! signing_manifest = "/etc/diskgate/signers.toml"
//! peer_idle_timeout_secs = 60
//! max_peers = 32
//! ```
use crate::auth::{SigningRequirement, EXPECTED_BUNDLE_ID, EXPECTED_TEAM_ID};
use crate::error::ConfigError;
use crate::executor::DEFAULT_CALLBACK_TIMEOUT;
use crate::safety::InternalSdPolicy;
use crate::transport::server::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_PEERS};
use crate::transport::{Endpoint, DEFAULT_RUNTIME_DIR, SERVICE_NAME};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the signing manifest.
pub const DEFAULT_SIGNING_MANIFEST: &str = "/etc/diskgate/signers.toml";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HelperConfig {
    pub service_name: String,
    pub runtime_dir: PathBuf,
    pub callback_timeout_secs: u64,
    pub internal_sd_policy: InternalSdPolicy,
    pub signing_manifest: PathBuf,
    pub expected_bundle_id: String,
    pub expected_team_id: String,
    pub peer_idle_timeout_secs: u64,
    pub max_peers: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT.as_secs(),
            internal_sd_policy: InternalSdPolicy::default(),
            signing_manifest: PathBuf::from(DEFAULT_SIGNING_MANIFEST),
            expected_bundle_id: EXPECTED_BUNDLE_ID.to_string(),
            expected_team_id: EXPECTED_TEAM_ID.to_string(),
            peer_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}

impl HelperConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.callback_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "callback_timeout_secs must be at least 1".into(),
            ));
        }
        if self.peer_idle_timeout_secs == 0 || self.max_peers == 0 {
            return Err(ConfigError::Invalid(
                "peer_idle_timeout_secs and max_peers must be at least 1".into(),
            ));
        }
        let name_ok = !self.service_name.is_empty()
            && self
                .service_name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');
        if !name_ok {
            return Err(ConfigError::Invalid(format!(
                "service_name {:?} is not a reverse-DNS identifier",
                self.service_name
            )));
        }
        if self.expected_bundle_id.is_empty() || self.expected_team_id.is_empty() {
            return Err(ConfigError::Invalid(
                "expected bundle and team identifiers must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::for_service(&self.service_name, &self.runtime_dir)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_idle_timeout_secs)
    }

    pub fn signing_requirement(&self) -> SigningRequirement {
        SigningRequirement {
            bundle_id: self.expected_bundle_id.clone(),
            team_id: self.expected_team_id.clone(),
        }
    }
}
