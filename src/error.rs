use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("X.509 parsing error: {0}")]
    X509(String),

    #[error("No schema registered for '{0}'")]
    SchemaNotFound(String),

    #[error("Unknown element or attribute '{path}'")]
    UnknownSchemaElement { path: String },

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Duplicate collection entry in '{section}': {key}")]
    DuplicateKey { section: String, key: String },

    #[error("Duplicate binding: {0}")]
    DuplicateBinding(String),

    #[error("Section '{section}' at '{scope}' is already being edited")]
    SectionLocked { scope: String, section: String },

    #[error("Revert operation cannot be done at server level")]
    RevertNotAllowed,

    #[error("Cannot reorder inherited entry {key}")]
    CannotReorderInherited { key: String },

    #[error("No collection entry matches {key}")]
    ItemNotFound { key: String },

    #[error("Edit session is already committed or reverted")]
    EditClosed,

    #[error("Certificate {thumbprint} not found in store '{store}'")]
    CertificateNotFound { thumbprint: String, store: String },

    #[error("The specified network password is not correct")]
    InvalidPassword,

    #[error("Malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("Failed to commit '{}': {source}", path.display())]
    CommitIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Binding table error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The single operation failed; nothing else is affected.
    Fatal,
    /// The caller can correct the input or retry.
    Recoverable,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateKey { .. }
            | Error::DuplicateBinding(_)
            | Error::SectionLocked { .. }
            | Error::RevertNotAllowed
            | Error::CannotReorderInherited { .. }
            | Error::ItemNotFound { .. }
            | Error::CertificateNotFound { .. }
            | Error::InvalidPassword
            | Error::MalformedCertificate(_)
            | Error::InvalidInput(_) => ErrorKind::Recoverable,
            _ => ErrorKind::Fatal,
        }
    }

    /// Message suitable for showing to an operator. Underlying OS and
    /// parser errors are summarised rather than passed through.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(msg) => format!("The settings file is invalid: {msg}"),
            Error::Io(_) | Error::Json(_) | Error::Yaml(_) => {
                "A local file could not be read or written.".to_string()
            }
            Error::Xml(_) => "The configuration file is not well-formed XML.".to_string(),
            Error::X509(_) | Error::MalformedCertificate(_) => {
                "The certificate file is damaged or is not a PKCS#12 archive.".to_string()
            }
            Error::SchemaNotFound(name) => {
                format!("The configuration section '{name}' is not recognized.")
            }
            Error::UnknownSchemaElement { path } => {
                format!("Unrecognized configuration element or attribute '{path}'.")
            }
            Error::SchemaViolation(msg) => format!("The configuration value is invalid: {msg}"),
            Error::DuplicateKey { key, .. } => {
                format!("Cannot add duplicate collection entry {key}.")
            }
            Error::DuplicateBinding(binding) => {
                format!("The binding '{binding}' is already in use.")
            }
            Error::SectionLocked { section, scope } => format!(
                "The section '{section}' at '{scope}' is being edited elsewhere. Try again later."
            ),
            Error::RevertNotAllowed => {
                "Revert operation cannot be done at server level.".to_string()
            }
            Error::CannotReorderInherited { .. } => {
                "Inherited entries cannot be moved at this level.".to_string()
            }
            Error::ItemNotFound { key } => format!("The entry {key} no longer exists."),
            Error::EditClosed => "The changes were already saved or discarded.".to_string(),
            Error::CertificateNotFound { thumbprint, store } => {
                format!("Certificate {thumbprint} was not found in the '{store}' store.")
            }
            Error::InvalidPassword => "The specified password is not correct.".to_string(),
            Error::CommitIo { path, .. } => format!(
                "Saving '{}' failed. The previous configuration was kept.",
                path.display()
            ),
            Error::InvalidInput(msg) => format!("The request is invalid: {msg}"),
            Error::Transport(_) => "The certificate binding table could not be updated.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::RevertNotAllowed.kind(), ErrorKind::Recoverable);
        assert_eq!(Error::InvalidPassword.kind(), ErrorKind::Recoverable);
        assert_eq!(
            Error::CommitIo {
                path: PathBuf::from("/tmp/x"),
                source: std::io::Error::other("disk full"),
            }
            .kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_user_message_hides_os_detail() {
        let err = Error::Transport("SetServiceConfiguration returned 183".to_string());
        assert!(!err.user_message().contains("183"));
        let err = Error::CommitIo {
            path: PathBuf::from("/etc/app.config"),
            source: std::io::Error::other("errno 28"),
        };
        assert!(!err.user_message().contains("28"));
    }
}
