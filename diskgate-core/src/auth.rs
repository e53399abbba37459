//! Authentication of inbound callers.
//!
//! Runs on the helper side for every message, before any privileged effect.
//! The identity is built from what the kernel says about the connection,
//! never from fields in the message, and every step fails closed:
//!
//! 1. a caller already running as root is refused,
//! 2. a code identity is derived from the peer's process,
//! 3. that identity must carry a valid, untampered signature,
//! 4. its bundle and team identifiers must match the expected values.
use crate::error::{ConfigError, SecurityError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Bundle identifier of the only application allowed to drive the helper.
pub const EXPECTED_BUNDLE_ID: &str = "io.diskgate.app";

/// Team identifier the trusted application is signed with.
pub const EXPECTED_TEAM_ID: &str = "5K8D2N7QXA";

/// What the kernel reports about the process at the other end of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Effective UID of the peer.
    pub uid: u32,
    /// PID of the peer, when the platform reports it.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    /// Reads the peer credentials of a connected Unix socket.
    #[cfg(target_os = "linux")]
    pub fn from_stream(stream: &std::os::unix::net::UnixStream) -> Result<Self, SecurityError> {
        use nix::sys::socket::{getsockopt, sockopt};

        let creds = getsockopt(stream, sockopt::PeerCredentials)
            .map_err(|e| SecurityError::CredentialsUnavailable(e.to_string()))?;
        Ok(Self {
            uid: creds.uid(),
            pid: Some(creds.pid()),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn from_stream(_stream: &std::os::unix::net::UnixStream) -> Result<Self, SecurityError> {
        Err(SecurityError::CredentialsUnavailable(
            "peer credentials are not supported on this platform".into(),
        ))
    }
}

/// A verifiable identity of the code running in a peer process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeIdentity {
    pub pid: i32,
    /// Path of the executable image the process runs.
    pub executable: PathBuf,
    /// Lowercase hex SHA-256 of the executable image.
    pub digest: String,
}

/// Signing information extracted from a verified code identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningInfo {
    pub bundle_id: String,
    pub team_id: String,
}

/// Derives and verifies code identities. One implementation per platform.
pub trait CodeIdentitySource: Send + Sync {
    /// Derives the code identity of the peer from trusted kernel metadata.
    fn code_identity(&self, peer: &PeerCredentials) -> Result<CodeIdentity, SecurityError>;

    /// Checks that the identity's signature is valid and untampered.
    fn check_validity(&self, identity: &CodeIdentity) -> Result<(), SecurityError>;

    /// Extracts the signing information of a valid identity.
    fn signing_info(&self, identity: &CodeIdentity) -> Result<SigningInfo, SecurityError>;
}

/// The identity values a caller must present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequirement {
    pub bundle_id: String,
    pub team_id: String,
}

impl Default for SigningRequirement {
    fn default() -> Self {
        Self {
            bundle_id: EXPECTED_BUNDLE_ID.to_string(),
            team_id: EXPECTED_TEAM_ID.to_string(),
        }
    }
}

/// An authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIdentity {
    pub effective_uid: u32,
    pub bundle_id: String,
    pub team_id: String,
    pub signature_valid: bool,
}

/// Authentication state of one connection.
///
/// The kernel records a socket's peer credentials at `connect()`, so they
/// are read once per connection. The caller's code identity is pinned at
/// first contact; a later message from a process whose image has changed
/// since is refused.
#[derive(Clone, Debug)]
pub struct PeerContext {
    credentials: PeerCredentials,
    pinned: Option<CodeIdentity>,
}

impl PeerContext {
    pub fn new(credentials: PeerCredentials) -> Self {
        Self {
            credentials,
            pinned: None,
        }
    }

    pub fn credentials(&self) -> &PeerCredentials {
        &self.credentials
    }

    /// The code identity recorded at first contact, if any.
    pub fn pinned(&self) -> Option<&CodeIdentity> {
        self.pinned.as_ref()
    }
}

/// Gatekeeper in front of the disk operation executor.
pub struct Authenticator<S> {
    source: S,
    requirement: SigningRequirement,
}

impl<S: CodeIdentitySource> Authenticator<S> {
    pub fn new(source: S, requirement: SigningRequirement) -> Self {
        Self {
            source,
            requirement,
        }
    }

    /// Authenticates one inbound message's sender.
    pub fn authenticate(&self, peer: &PeerCredentials) -> Result<ClientIdentity, SecurityError> {
        let result = self.authenticate_inner(peer, None);
        Self::log(peer, &result);
        result
    }

    /// Records the code identity of a freshly connected peer.
    ///
    /// Best effort: a peer whose identity cannot be read yet is pinned by its
    /// first message instead.
    pub fn pin(&self, peer: &mut PeerContext) {
        if peer.credentials.uid == 0 || peer.pinned.is_some() {
            return;
        }
        match self.source.code_identity(&peer.credentials) {
            Ok(identity) => peer.pinned = Some(identity),
            Err(e) => tracing::debug!(error = %e, "could not pin peer identity at connect"),
        }
    }

    /// Authenticates one message on a connection, checking the sender still
    /// runs the image it connected with.
    pub fn authenticate_peer(&self, peer: &mut PeerContext) -> Result<ClientIdentity, SecurityError> {
        let result = self.authenticate_inner(&peer.credentials, Some(&mut peer.pinned));
        Self::log(&peer.credentials, &result);
        result
    }

    fn log(peer: &PeerCredentials, result: &Result<ClientIdentity, SecurityError>) {
        match result {
            Ok(identity) => tracing::debug!(
                uid = identity.effective_uid,
                bundle_id = %identity.bundle_id,
                "caller authenticated"
            ),
            Err(e) => tracing::warn!(uid = peer.uid, pid = ?peer.pid, error = %e, "caller rejected"),
        }
    }

    /// Like [`Authenticator::authenticate`], reduced to a yes/no answer.
    pub fn is_trusted(&self, peer: &PeerCredentials) -> bool {
        self.authenticate(peer).is_ok()
    }

    fn authenticate_inner(
        &self,
        peer: &PeerCredentials,
        pinned: Option<&mut Option<CodeIdentity>>,
    ) -> Result<ClientIdentity, SecurityError> {
        if peer.uid == 0 {
            return Err(SecurityError::RootCallerRejected);
        }

        let identity = self.source.code_identity(peer)?;
        if let Some(pinned) = pinned {
            match pinned {
                Some(first) if *first != identity => {
                    return Err(SecurityError::InvalidSignature(format!(
                        "process {} changed its executable since it connected",
                        identity.pid
                    )));
                }
                Some(_) => {}
                None => *pinned = Some(identity.clone()),
            }
        }
        self.source.check_validity(&identity)?;

        let info = self.source.signing_info(&identity)?;
        if info.bundle_id != self.requirement.bundle_id {
            return Err(SecurityError::IdentityMismatch {
                expected: self.requirement.bundle_id.clone(),
                found: info.bundle_id,
            });
        }
        if info.team_id != self.requirement.team_id {
            return Err(SecurityError::IdentityMismatch {
                expected: self.requirement.team_id.clone(),
                found: info.team_id,
            });
        }

        Ok(ClientIdentity {
            effective_uid: peer.uid,
            bundle_id: info.bundle_id,
            team_id: info.team_id,
            signature_valid: true,
        })
    }
}

/// One trusted executable in a [`SigningManifest`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SignerEntry {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the executable.
    pub sha256: String,
    pub bundle_id: String,
    pub team_id: String,
}

/// The list of executables whose digests the helper vouches for.
///
/// Stored as TOML:
///
/// ```toml
/// [[signer]]
/// path = "/usr/bin/diskgate-gui"
/// sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
/// bundle_id = "io.diskgate.app"
/// team_id = "5K8D2N7QXA"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SigningManifest {
    #[serde(default, rename = "signer")]
    pub signers: Vec<SignerEntry>,
}

impl SigningManifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        for signer in &manifest.signers {
            let well_formed = signer.sha256.len() == 64
                && signer.sha256.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
            if !well_formed {
                return Err(ConfigError::Invalid(format!(
                    "signer {} has a malformed sha256 digest",
                    signer.path.display()
                )));
            }
        }
        Ok(manifest)
    }

    /// The entry for an executable path, if any.
    pub fn entry_for(&self, executable: &Path) -> Option<&SignerEntry> {
        self.signers.iter().find(|s| s.path == executable)
    }
}
