//! Error types for rd-engine

use thiserror::Error;

use crate::backend::Action;

/// Result type alias using rd-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the VM backend
#[derive(Error, Debug)]
pub enum Error {
    /// User-facing backend failure; `fatal` decides whether `start` rethrows it
    #[error("{title}: {message}")]
    Backend {
        title: String,
        message: String,
        fatal: bool,
    },

    /// Kubernetes distribution errors
    #[error("{title}: {message}")]
    Kubernetes { title: String, message: String },

    /// The version catalog is empty
    #[error("No version available")]
    NoVersionAvailable,

    /// A subprocess exited unsuccessfully
    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Failure inside a tracked progress step
    #[error("{description}: {source}")]
    Step {
        description: String,
        #[source]
        source: Box<Error>,
    },

    /// A lifecycle call was rejected because another one is running
    #[error("backend is busy ({0})")]
    Busy(Action),

    /// A generated privileged command is malformed
    #[error("Privileged command error: {0}")]
    Privilege(String),

    /// The host elevation prompt was dismissed
    #[error("administrative access was denied")]
    ElevationDenied,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// k3s catalog and download errors
    #[error("k3s distribution error: {0}")]
    Dist(#[from] k3s_dist::DistError),
}

impl Error {
    /// A fatal user-facing error.
    pub fn fatal(title: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            title: title.into(),
            message: message.into(),
            fatal: true,
        }
    }

    /// A user-facing error that leaves the application running.
    pub fn recoverable(title: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            title: title.into(),
            message: message.into(),
            fatal: false,
        }
    }

    /// Whether `start` must propagate this error to its caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Backend { fatal, .. } => *fatal,
            Error::Step { source, .. } => source.is_fatal(),
            _ => true,
        }
    }

    /// The error with any step tag removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Description of the step that was running when this error happened.
    pub fn step_description(&self) -> Option<&str> {
        match self {
            Error::Step { description, .. } => Some(description),
            _ => None,
        }
    }

    /// The command line of a failed subprocess, if that is what failed.
    pub fn last_command(&self) -> Option<&str> {
        match self.root() {
            Error::Command { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Short title for error dialogs.
    pub fn title(&self) -> String {
        match self.root() {
            Error::Backend { title, .. } | Error::Kubernetes { title, .. } => title.clone(),
            Error::NoVersionAvailable => "No version available".to_string(),
            _ => "Error Starting Kubernetes".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_non_fatal_backend_errors_are_swallowed() {
        assert!(!Error::recoverable("t", "m").is_fatal());
        assert!(Error::fatal("t", "m").is_fatal());
        assert!(Error::NoVersionAvailable.is_fatal());
        let tagged = Error::Step {
            description: "Installing k3s".into(),
            source: Box::new(Error::recoverable("t", "m")),
        };
        assert!(!tagged.is_fatal());
    }

    #[test]
    fn last_command_looks_through_steps() {
        let err = Error::Step {
            description: "Starting VM".into(),
            source: Box::new(Error::Command {
                command: "limactl start 0".into(),
                code: Some(1),
                stderr: "boom".into(),
            }),
        };
        assert_eq!(err.last_command(), Some("limactl start 0"));
        assert_eq!(err.step_description(), Some("Starting VM"));
        assert_eq!(err.title(), "Error Starting Kubernetes");
    }
}
