//! Deployment and signing parameter structs.
//!
//! These are filled in by the build driver, read-only for the duration of a
//! single deploy or sign call, and never persisted.

use std::path::PathBuf;

use crate::error::{DeployError, DeployResult};

/// Parameters for one patching run: which engine template to rewrite, what
/// to inject, and where the result goes.
#[derive(Debug, Clone, Default)]
pub struct DeployParams {
    /// Path to the precompiled standalone engine template.
    pub engine: PathBuf,
    /// Path the patched executable is written to.
    pub output: PathBuf,
    /// Serialized project data (bundle metadata + script bytecode).
    /// `None` selects icons-only mode on Windows; it is an error elsewhere.
    pub project: Option<Vec<u8>>,
    /// Optional payload blob embedded verbatim ahead of the project data.
    pub payload: Option<Vec<u8>>,
    /// Application icon (`.ico`), Windows only.
    pub app_icon: Option<PathBuf>,
    /// Document icon (`.ico`), Windows only.
    pub doc_icon: Option<PathBuf>,
    /// Version-info key/value strings, in the order they should appear.
    pub version_info: Vec<(String, String)>,
    /// Path to a manifest XML file, Windows only.
    pub manifest: Option<PathBuf>,
}

impl DeployParams {
    /// Validate the parts every platform needs.
    pub fn validate(&self) -> DeployResult<()> {
        if self.engine.as_os_str().is_empty() {
            return Err(DeployError::BadParameters(
                "engine template path is empty".into(),
            ));
        }
        if self.output.as_os_str().is_empty() {
            return Err(DeployError::BadParameters("output path is empty".into()));
        }
        Ok(())
    }

    /// Project bytes, or the platform-appropriate structural error.
    pub fn require_project(&self) -> DeployResult<&[u8]> {
        self.project
            .as_deref()
            .ok_or(DeployError::NoProjectSection)
    }
}

/// Parameters for Authenticode-signing an already patched Windows output.
#[derive(Debug, Clone, Default)]
pub struct SignParams {
    /// The PE file to sign. Mutated in place.
    pub input: PathBuf,
    /// PKCS7 certificate container (DER or base64/PEM wrapped SignedData
    /// holding the leaf certificate and any intermediates).
    pub certificate: PathBuf,
    /// Private key file: legacy PVK or PKCS12.
    pub private_key: PathBuf,
    /// Passphrase for an encrypted PVK or PKCS12 key.
    pub passphrase: Option<String>,
    /// Timestamp-authority URL. When set, a failed counter-signature fails
    /// the whole signing operation.
    pub timestamper: Option<String>,
    /// Human-readable program description carried in SpcSpOpusInfo.
    pub description: Option<String>,
    /// Publisher URL carried in SpcSpOpusInfo.
    pub url: Option<String>,
}

impl SignParams {
    pub fn validate(&self) -> DeployResult<()> {
        if self.input.as_os_str().is_empty() {
            return Err(DeployError::BadParameters("input path is empty".into()));
        }
        if self.certificate.as_os_str().is_empty() {
            return Err(DeployError::BadParameters(
                "certificate path is empty".into(),
            ));
        }
        if self.private_key.as_os_str().is_empty() {
            return Err(DeployError::BadParameters(
                "private key path is empty".into(),
            ));
        }
        if let Some(url) = &self.timestamper {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(DeployError::BadParameters(format!(
                    "timestamper URL must be http(s), got: {url}"
                )));
            }
        }
        Ok(())
    }
}
