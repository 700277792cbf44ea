//! Error types shared by the patcher and signer pipelines.
//!
//! Every failure is fatal to the current operation: callers must treat the
//! output file as invalid and delete it before retrying. Nothing here is
//! retried internally except the timestamp-authority POST, which has its own
//! bounded retry loop before surfacing `TimestampFailed`.

use thiserror::Error;

/// Result type for deploy and signing operations
pub type DeployResult<T> = Result<T, DeployError>;

/// Failure taxonomy for executable patching and Authenticode signing.
#[derive(Error, Debug)]
pub enum DeployError {
    // ---- format errors ----
    #[error("bad magic bytes: not a valid {0} file")]
    BadMagic(&'static str),

    #[error("unsupported ELF class byte {0:#04x}")]
    BadClass(u8),

    #[error("unsupported data encoding: engine templates are little-endian only")]
    BadEncoding,

    #[error("unsupported {format} version {version}")]
    BadVersion { format: &'static str, version: u32 },

    #[error("unexpected ELF object type {got:#06x} (expected {expected:#06x})")]
    BadObjectType { got: u16, expected: u16 },

    #[error("unsupported machine type {0:#06x}")]
    BadMachine(u16),

    #[error("{what} entry size is {got} bytes, expected {expected}")]
    HeaderSizeMismatch {
        what: &'static str,
        got: u64,
        expected: u64,
    },

    #[error("truncated {0} record")]
    Truncated(&'static str),

    #[error("string table index {0:#x} out of range")]
    BadStringIndex(u64),

    #[error("unterminated string in string table at {0:#x}")]
    UnterminatedString(u64),

    #[error("unknown optional header magic {0:#06x}")]
    BadOptionalMagic(u16),

    // ---- structural invariants ----
    #[error("engine template has no project section")]
    NoProjectSection,

    #[error("engine template has no resource section")]
    NoResourceSection,

    #[error("no loadable segment contains the project section")]
    NoProjectSegment,

    #[error("payload section lies outside the project segment")]
    PayloadOutsideProjectSegment,

    #[error("section layout violates the project-last ordering invariant")]
    BadSectionOrder,

    #[error("{0} does not fit the containing field width")]
    Overflow(&'static str),

    // ---- resource errors ----
    #[error("malformed icon file: {0}")]
    BadIconFile(String),

    #[error("malformed resource directory: {0}")]
    BadResourceTree(String),

    // ---- cryptographic errors ----
    #[error("bad certificate container: {0}")]
    BadCertificate(String),

    #[error("bad private key: {0}")]
    BadPrivateKey(String),

    #[error("private key does not match the signing certificate")]
    CertMismatch,

    #[error("signature construction failed: {0}")]
    BadSignature(String),

    #[error("existing certificate table is not at the end of the file")]
    BadSecuritySection,

    #[error("timestamp request failed: {0}")]
    TimestampFailed(String),

    #[error("malformed timestamp authority response: {0}")]
    BadTimestampResponse(String),

    #[error("crypto library error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    // ---- environment ----
    #[error("invalid parameters: {0}")]
    BadParameters(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0} is not supported")]
    Unsupported(&'static str),
}
