use thiserror::Error;

/// Stage of an external command that failed.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("could not start '{command}': {source}")]
    Start {
        command: String,
        source: std::io::Error,
    },

    #[error("'{command}' exited unsuccessfully ({status})")]
    Run { command: String, status: String },

    #[error("could not close session for '{command}': {source}")]
    Close {
        command: String,
        source: std::io::Error,
    },

    #[error("'{command}' was cancelled")]
    Cancelled { command: String },
}

/// Errors which may be returned while provisioning a virtual machine.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("{target} is missing required fields: [{}]", missing.join(", "))]
    Configuration {
        target: &'static str,
        missing: Vec<String>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("domain {domain} not found: {reason}")]
    NotFound { domain: String, reason: String },

    #[error("domain {domain} already exists")]
    AlreadyExists { domain: String },

    #[error("base domain {domain} is unusable: {reason}")]
    InvalidBase { domain: String, reason: String },

    #[error("{tool} failed: {stderr}")]
    ExternalTool {
        tool: String,
        stderr: String,
        #[source]
        source: ShellError,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("hypervisor rejected definition: {0}")]
    Definition(String),

    #[error("failed to start domain {domain}: {reason}")]
    Start { domain: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("could not serialize {what}: {reason}")]
    Serialize { what: String, reason: String },

    #[error("provisioning of {name} was cancelled")]
    Cancelled { name: String },

    #[error("{primary}; additionally failed to roll back: {cleanup}")]
    Rollback {
        primary: Box<ProvisionError>,
        cleanup: Box<ProvisionError>,
    },
}

impl ProvisionError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ProvisionError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure was caused by the request rather than the host.
    pub fn is_client_error(&self) -> bool {
        match self {
            ProvisionError::Configuration { .. } | ProvisionError::InvalidRequest(_) => true,
            ProvisionError::Rollback { primary, .. } => primary.is_client_error(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            ProvisionError::AlreadyExists { .. } => true,
            ProvisionError::Rollback { primary, .. } => primary.is_conflict(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ProvisionError::NotFound { .. } => true,
            ProvisionError::Rollback { primary, .. } => primary.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
