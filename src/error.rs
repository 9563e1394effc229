use miette::Diagnostic;
use thiserror::Error;

/// Error taxonomy for the range orchestrator and its collaborators.
///
/// Provider-facing calls are wrapped by [`crate::orchestrator::safe::safe_execute`],
/// which tags failures with the failing operation and range id before they
/// reach the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum RangeError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    #[diagnostic(help("check the YAML against the range description shape in the docs"))]
    ConfigParse { path: String, message: String },

    #[error("failed to write config: {path}")]
    ConfigWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("range '{range_id}' already exists")]
    #[diagnostic(help("pick a different --range-id, or `cyris destroy` the existing one first"))]
    RangeExists { range_id: String },

    #[error("range '{range_id}' not found")]
    #[diagnostic(help("run `cyris list` to see known ranges"))]
    RangeNotFound { range_id: String },

    #[error("range '{range_id}' is not in a terminal state (status: {status})")]
    #[diagnostic(help("pass --force to override, or `cyris destroy` first"))]
    NotTerminal { range_id: String, status: String },

    #[error("IP collision planning network '{network}': address {addr} claimed by both '{a}' and '{b}'")]
    IpCollision {
        network: String,
        addr: String,
        a: String,
        b: String,
    },

    #[error("failed to download base image: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{command} failed: {message}")]
    #[diagnostic(help("ensure {command} is installed and accessible"))]
    ExternalCommand { command: String, message: String },

    #[error("libvirt error during {operation}: {message}")]
    #[diagnostic(help("{hint}"))]
    Virtualization {
        operation: String,
        message: String,
        hint: String,
    },

    #[error("network error during {operation}: {message}")]
    Network { operation: String, message: String },

    #[error("resource error: {message}")]
    Resource {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("gateway error: {message}")]
    Gateway { message: String },

    #[error("tunnel error: {message}")]
    Tunnel { message: String },

    #[error("task '{task_id}' ({kind}) failed on '{guest}': {message}")]
    Task {
        task_id: String,
        kind: String,
        guest: String,
        message: String,
    },

    #[error("domain '{name}' not found")]
    #[diagnostic(help("run `cyris status` to check whether the guest ever booted"))]
    DomainNotFound { name: String },

    #[error("timed out waiting for '{name}': {reason}")]
    Timeout { name: String, reason: String },

    #[error("SSH error connecting to {host}: {message}")]
    Ssh {
        host: String,
        message: String,
        retryable: bool,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mount source not found: {path}")]
    #[diagnostic(help("check that the directory exists"))]
    MountSourceNotFound { path: String },

    #[error("{command} is not yet implemented")]
    NotImplemented { command: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal orchestration error during {operation}: {message}")]
    Internal { operation: String, message: String },
}

impl RangeError {
    /// Whether this failure should push the owning range into `ERROR` rather
    /// than leaving it in its current state. Task failures are reported but
    /// do not poison the whole range on their own.
    pub fn is_fatal_to_range(&self) -> bool {
        !matches!(self, RangeError::Task { .. })
    }
}

pub type Result<T> = std::result::Result<T, RangeError>;
