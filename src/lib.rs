//! Standalone engine deployment: executable-image patching and signing.
//!
//! A standalone build takes a precompiled engine template and turns it into
//! a distributable executable by splicing the project data (and an optional
//! payload blob) into reserved sections, fixing every downstream offset the
//! splice disturbs. On Windows the resource tree is rebuilt with the
//! product's icons, version info and manifest, and the result can be
//! Authenticode-signed.
//!
//! Entry points:
//! - [`elf::deploy_linux`] / [`elf::deploy_android`] for ELF engines
//! - [`pe::deploy_windows`] for PE engines
//! - [`sign::sign_windows`] to sign a patched PE in place
//!
//! Each call is a single blocking pipeline over whole in-memory images; the
//! only suspension point is the timestamp-authority HTTP POST. Callers must
//! treat any error as "the output file is invalid, delete it and retry".

pub mod dmg;
pub mod elf;
pub mod error;
pub mod params;
pub mod pe;
pub mod record;
pub mod sign;

pub use error::{DeployError, DeployResult};
pub use params::{DeployParams, SignParams};
