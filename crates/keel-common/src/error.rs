//! Error types for keel.
//!
//! Errors are structured with fields to aid debugging when a reconciliation
//! fails halfway across a fleet. Remote failures always carry the host and
//! the command text; multi-host failures carry every failing host.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available.
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// A single host failure recorded during a multi-host step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    /// Host that failed.
    pub host: String,
    /// Rendered error for that host.
    pub message: String,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.message)
    }
}

/// Newtype so the failure list renders inline in the error message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostFailures(pub Vec<HostFailure>);

impl fmt::Display for HostFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Main error type for keel operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The desired state or a requested transition is invalid.
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration.
        cluster: String,
        /// Description of what's invalid.
        message: String,
        /// The invalid field path (e.g., "spec.masters.ipList").
        field: Option<String>,
    },

    /// A host could not be reached over SSH.
    #[error("host {host} unreachable: {message}")]
    Connectivity {
        /// Unreachable host.
        host: String,
        /// Transport-level description.
        message: String,
    },

    /// A host never became reachable within the readiness budget.
    #[error("wait for [{host}] ssh ready timeout after {attempts} attempts")]
    ReadinessTimeout {
        /// First host that never answered.
        host: String,
        /// Number of pings spent on it.
        attempts: u32,
    },

    /// A node did not report Ready after a restart.
    #[error("node {host} not ready after {polls} polls")]
    NodeNotReady {
        /// Host that stayed NotReady.
        host: String,
        /// Number of Ready checks spent on it.
        polls: u32,
    },

    /// A remote command exited non-zero.
    #[error("command failed on {host} (exit {status}): {command}: {output}")]
    RemoteCommand {
        /// Host the command ran on.
        host: String,
        /// Command text as sent.
        command: String,
        /// Remote exit status, -1 when killed by a signal.
        status: i32,
        /// Combined, trimmed output.
        output: String,
    },

    /// Content on both ends of a transfer differs after copying.
    #[error("checksum mismatch on {host} for {path}: local {local}, remote {remote}")]
    Checksum {
        /// Remote host.
        host: String,
        /// Path that was transferred.
        path: String,
        /// Local digest.
        local: String,
        /// Remote digest.
        remote: String,
    },

    /// A file transfer failed before verification.
    #[error("transfer of {path} to/from {host} failed: {message}")]
    Transfer {
        /// Remote host.
        host: String,
        /// Path being transferred.
        path: String,
        /// Description of what failed.
        message: String,
    },

    /// Output from an external tool could not be understood.
    #[error("parse error [{context}]: {message}")]
    Parse {
        /// What was being parsed (e.g., "kubeadm init output").
        context: String,
        /// Description of what failed.
        message: String,
    },

    /// Several hosts failed during one step; every failure is listed.
    #[error("{} host(s) failed: {failures}", .failures.0.len())]
    PartialFailure {
        /// All recorded failures, in the order hosts were attempted.
        failures: HostFailures,
    },

    /// Template rendering failed.
    #[error("template error: {message}")]
    Template {
        /// Description of what failed.
        message: String,
    },

    /// Certificate generation or parsing failed.
    #[error("pki error: {message}")]
    Pki {
        /// Description of what failed.
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed.
        message: String,
        /// The document kind being serialized (if known).
        kind: Option<String>,
    },

    /// Local filesystem or process error.
    #[error("io error [{context}]: {message}")]
    Io {
        /// Operation that failed (e.g., "write Clusterfile").
        context: String,
        /// Description of what failed.
        message: String,
    },

    /// The operator aborted the run.
    #[error("operation cancelled")]
    Cancelled,

    /// Internal/operational error.
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed.
        message: String,
        /// Context where the error occurred (e.g., "pipeline", "upgrade").
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context.
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path.
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connectivity error for a host.
    pub fn connectivity(host: impl ToString, msg: impl Into<String>) -> Self {
        Self::Connectivity {
            host: host.to_string(),
            message: msg.into(),
        }
    }

    /// Create a remote command failure.
    pub fn remote_command(
        host: impl ToString,
        command: impl Into<String>,
        status: i32,
        output: impl Into<String>,
    ) -> Self {
        Self::RemoteCommand {
            host: host.to_string(),
            command: command.into(),
            status,
            output: output.into().trim().to_string(),
        }
    }

    /// Create a transfer error.
    pub fn transfer(host: impl ToString, path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transfer {
            host: host.to_string(),
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Collapse per-host failures into one error.
    ///
    /// Returns `None` for an empty list so callers can write
    /// `if let Some(err) = Error::partial(failures) { return Err(err) }`.
    pub fn partial(failures: Vec<HostFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self::PartialFailure {
                failures: HostFailures(failures),
            })
        }
    }

    /// Create a template error.
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
        }
    }

    /// Create a PKI error.
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context.
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, msg: impl ToString) -> Self {
        Self::Io {
            context: context.into(),
            message: msg.to_string(),
        }
    }

    /// Create an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context.
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only transport-level failures are worth another attempt. A remote
    /// command that ran and failed will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connectivity { .. } | Error::ReadinessTimeout { .. }
        )
    }

    /// Get the host if this error is associated with a single host.
    pub fn host(&self) -> Option<&str> {
        match self {
            Error::Connectivity { host, .. }
            | Error::ReadinessTimeout { host, .. }
            | Error::NodeNotReady { host, .. }
            | Error::RemoteCommand { host, .. }
            | Error::Checksum { host, .. }
            | Error::Transfer { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster.
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization_for_kind("yaml", e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_for_kind("json", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A failed remote command tells the operator where and what.
    ///
    /// When kubeadm fails on one host, the error must name the host and
    /// the exact command so the operator can rerun it by hand.
    #[test]
    fn story_remote_failure_names_host_and_command() {
        let err = Error::remote_command(
            "10.0.0.2",
            "kubeadm join --config=/var/lib/keel/kubeadm-join-config.yaml",
            1,
            "  error execution phase preflight\n",
        );
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.2"));
        assert!(msg.contains("kubeadm join"));
        assert!(msg.contains("exit 1"));
        assert!(msg.ends_with("error execution phase preflight"));
        assert_eq!(err.host(), Some("10.0.0.2"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn story_validation_rejects_before_any_remote_action() {
        let err = Error::validation_for_field(
            "prod",
            "spec.masters.ipList",
            "cannot join and delete masters in one pass",
        );
        assert!(err.to_string().contains("validation error for prod"));
        assert_eq!(err.cluster(), Some("prod"));
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.masters.ipList"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: A node upgrade that fails on several workers lists all of them.
    #[test]
    fn story_partial_failure_lists_every_host() {
        let err = Error::partial(vec![
            HostFailure {
                host: "10.0.0.4".into(),
                message: "not ready".into(),
            },
            HostFailure {
                host: "10.0.0.5".into(),
                message: "kubelet restart failed".into(),
            },
        ])
        .expect("non-empty failures");

        let msg = err.to_string();
        assert!(msg.starts_with("2 host(s) failed"));
        assert!(msg.contains("10.0.0.4: not ready"));
        assert!(msg.contains("10.0.0.5: kubelet restart failed"));
        assert!(err.host().is_none());
    }

    #[test]
    fn empty_failure_list_is_not_an_error() {
        assert!(Error::partial(Vec::new()).is_none());
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(Error::connectivity("10.0.0.1", "connection refused").is_retryable());
        assert!(Error::ReadinessTimeout {
            host: "10.0.0.1".into(),
            attempts: 3
        }
        .is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::parse("kubeadm init output", "no join command").is_retryable());
    }

    #[test]
    fn readiness_timeout_message_names_host() {
        let err = Error::ReadinessTimeout {
            host: "10.0.0.9".into(),
            attempts: 6,
        };
        assert_eq!(
            err.to_string(),
            "wait for [10.0.0.9] ssh ready timeout after 6 attempts"
        );
    }

    #[test]
    fn serde_errors_convert_with_kind() {
        let yaml_err = serde_yaml::from_str::<u32>("not: a number").unwrap_err();
        match Error::from(yaml_err) {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("yaml")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
