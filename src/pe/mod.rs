//! PE engine patching for Windows.
//!
//! The template carries three trailing sections: an optional `.payload`, a
//! `.project` placeholder, and `.rsrc`. Patching replaces the first two with
//! caller data, regenerates the resource tree with the requested icons,
//! version info and manifest, and rewrites the headers so the result is a
//! valid image. Icons-only mode leaves the project bytes alone and touches
//! nothing but `.rsrc`.

pub mod icon;
pub mod relocate;
pub mod resource;
pub mod types;
pub mod version;

use std::fs;

use log::info;

pub use relocate::{relocate, ResourceUpdates};
pub use types::{PeFormat, PeImage};

use crate::error::DeployResult;
use crate::params::DeployParams;

/// Patch a Windows engine template.
pub fn deploy_windows(params: &DeployParams) -> DeployResult<()> {
    params.validate()?;

    info!(
        "patching PE engine {} -> {}",
        params.engine.display(),
        params.output.display()
    );
    let template = fs::read(&params.engine)?;

    let app_icon = read_optional(&params.app_icon)?;
    let doc_icon = read_optional(&params.doc_icon)?;
    let manifest = read_optional(&params.manifest)?;
    let updates = ResourceUpdates {
        app_icon: app_icon.as_deref(),
        doc_icon: doc_icon.as_deref(),
        version_info: &params.version_info,
        manifest: manifest.as_deref(),
    };

    let patched = relocate(
        &template,
        params.project.as_deref(),
        params.payload.as_deref(),
        &updates,
    )?;
    fs::write(&params.output, patched)?;

    info!("wrote {}", params.output.display());
    Ok(())
}

fn read_optional(path: &Option<std::path::PathBuf>) -> DeployResult<Option<Vec<u8>>> {
    match path {
        Some(path) => Ok(Some(fs::read(path)?)),
        None => Ok(None),
    }
}
