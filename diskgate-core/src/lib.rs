//! The core, UI-agnostic library behind the `diskgate` privileged disk helper.
//!
//! `diskgate-core` lets an unprivileged front end ask a root helper process to
//! unmount or eject a whole disk, and lets the helper decide whether it should.
//! The helper authenticates every caller from kernel-reported credentials,
//! refuses destructive operations on internal disks, and drives the OS through
//! a session/run-loop/callback arbitration model.
//!
//! The library is structured into several key modules:
//! - [`codec`]: The fixed-size message frame and its typed payload records.
//! - [`transport`]: The named Unix socket endpoint, with a [`transport::server`]
//!   side for the helper and a [`transport::client`] side for front ends.
//! - [`auth`]: Caller authentication against a signing requirement.
//! - [`safety`]: Internal/external classification and the destructive-op guard.
//! - [`arbitration`]: The disk arbitration seam: sessions, run loop, callbacks.
//! - [`executor`]: Runs one guarded unmount or eject at a time.
//! - [`service`]: The helper's per-message pipeline.
//! - [`client`]: The request API front ends use.
//! - [`platform`]: The Linux arbiter, device discovery and code identity.
//!
//! ## Example: Ejecting a Disk Through the Helper
//!
//! ```rust,no_run
//! use diskgate_core::client::HelperClient;
//! use diskgate_core::device::DeviceKind;
//! use diskgate_core::transport::client::ClientConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut helper = HelperClient::connect(ClientConfig::default(), true)?;
//!     let result = helper.request_eject("sdb", DeviceKind::Usb);
//!     if result.success {
//!         println!("Ejected.");
//!     } else {
//!         println!("Refused: {:?} {:?}", result.error_kind, result.message);
//!     }
//!     Ok(())
//! }
//! ```

pub mod arbitration;
pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod platform;
pub mod safety;
pub mod service;
pub mod testing;
pub mod transport;
