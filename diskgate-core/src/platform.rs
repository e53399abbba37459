//! Provides platform-specific functionality.
//!
//! This module holds everything that talks to the operating system directly:
//! discovering candidate block devices, the [`DiskArbiter`] that carries out
//! unmount and eject, and the [`CodeIdentitySource`] that derives a caller's
//! signed identity from its process.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the implementation for
//! the target OS. Only Linux is supported; on other targets the module is
//! empty and a front end has nothing to enumerate.
//!
//! [`DiskArbiter`]: crate::arbitration::DiskArbiter
//! [`CodeIdentitySource`]: crate::auth::CodeIdentitySource

#[cfg(target_os = "linux")]
mod identity;
#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use self::identity::ProcCodeIdentitySource;
#[cfg(target_os = "linux")]
pub use self::linux::*;
