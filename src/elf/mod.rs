//! ELF engine patching for desktop Linux and Android.
//!
//! The template is a precompiled engine whose link script places a
//! `.project` section (and optionally a `.payload` section) at the end of
//! the loadable image. Patching replaces those sections' contents and
//! rewrites every downstream file offset so the result is a valid ELF.

pub mod relocate;
pub mod types;

use std::fs;

use log::info;

pub use relocate::relocate;
pub use types::{ElfClass, ElfHeader, ElfMode, Section, Segment};

use crate::error::DeployResult;
use crate::params::DeployParams;

/// Patch a desktop Linux engine template.
pub fn deploy_linux(params: &DeployParams) -> DeployResult<()> {
    deploy(params, ElfMode::Desktop)
}

/// Patch an Android engine template (`ET_DYN`, ARM/AArch64/x86/x86-64 only).
pub fn deploy_android(params: &DeployParams) -> DeployResult<()> {
    deploy(params, ElfMode::Android)
}

fn deploy(params: &DeployParams, mode: ElfMode) -> DeployResult<()> {
    params.validate()?;
    let project = params.require_project()?;

    info!(
        "patching ELF engine {} -> {}",
        params.engine.display(),
        params.output.display()
    );
    let template = fs::read(&params.engine)?;
    let patched = relocate(&template, project, params.payload.as_deref(), mode)?;
    fs::write(&params.output, patched)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&params.output, fs::Permissions::from_mode(0o755))?;
    }

    info!("wrote {}", params.output.display());
    Ok(())
}
