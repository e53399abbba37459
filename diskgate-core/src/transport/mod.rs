//! Request/response channel between the unprivileged client and the helper.
//!
//! The helper listens on a Unix domain socket whose path is derived from the
//! well-known service name, so both sides find each other with no registry.
//! Each round trip is one fixed-size frame in each direction (see
//! [`crate::codec::FRAME_LEN`]).
//!
//! - [`server`]: binds the listener and dispatches each peer's messages to a
//!   [`server::MessageHandler`].
//! - [`client`]: connects, probes liveness, and performs synchronous
//!   send-with-reply calls under bounded timeouts.
use std::path::{Path, PathBuf};

pub mod client;
pub mod server;

/// Reverse-DNS identifier of the helper service.
pub const SERVICE_NAME: &str = "io.diskgate.helper";

/// Directory the helper socket lives in unless configured otherwise.
pub const DEFAULT_RUNTIME_DIR: &str = "/var/run";

/// The address of the helper service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    /// The endpoint of `service_name` inside `runtime_dir`.
    pub fn for_service(service_name: &str, runtime_dir: &Path) -> Self {
        Self {
            path: runtime_dir.join(format!("{service_name}.sock")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::for_service(SERVICE_NAME, Path::new(DEFAULT_RUNTIME_DIR))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
