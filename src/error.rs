//! Error types for the statecraft orchestration engine.
//!
//! This module provides the error hierarchy shared by every layer: network
//! configuration, the state store, provider APIs, and the orchestration
//! workflows. Provider failures are classified up front into transient,
//! disappeared, and precondition errors so that retry loops and workflows can
//! react without string matching.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for statecraft.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State store errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Orchestration workflow errors.
    #[error("{0}")]
    Engine(#[from] EngineError),

    /// A bounded poll exhausted its budget.
    #[error("Timed out after {waited_secs}s waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long the poll ran.
        waited_secs: u64,
    },

    /// More than one task failed within a scheduler phase.
    #[error("{0}")]
    Aggregate(AggregateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The network file was not found.
    #[error("Network file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The network file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// No credential could be resolved for a provider.
    #[error("No credentials for provider '{provider}' (set {env_var} or add it to {file})")]
    MissingCredential {
        /// Provider name.
        provider: String,
        /// Environment variable that was consulted.
        env_var: String,
        /// Credentials file that was consulted.
        file: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A definition names a type with no registered implementation.
    #[error("Unknown resource type '{type_tag}' for resource '{name}'")]
    UnknownResourceType {
        /// Resource name.
        name: String,
        /// The unknown type tag.
        type_tag: String,
    },

    /// A definition refers to a provider that is not configured.
    #[error("Resource '{name}' uses unknown provider '{provider}'")]
    UnknownProvider {
        /// Resource name.
        name: String,
        /// The unknown provider name.
        provider: String,
    },

    /// Circular dependency detected.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency {
        /// Description of the cycle.
        cycle: String,
    },
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// The state file was written by a newer release.
    #[error("State schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u32,
        /// Newest version this build understands.
        supported: u32,
    },

    /// The transaction was rolled back because a nested scope failed.
    #[error("Transaction rolled back after a failure in a nested scope")]
    RolledBack,

    /// Writing the state to its backend failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// Deployment does not exist.
    #[error("Deployment not found: {id}")]
    DeploymentNotFound {
        /// Requested id or name.
        id: String,
    },

    /// Deployment name or id prefix matches several deployments.
    #[error("Deployment '{id}' is ambiguous")]
    AmbiguousDeployment {
        /// Requested id or name.
        id: String,
    },

    /// Deployment still owns resources.
    #[error("Deployment {id} still has {count} resource(s); destroy them first")]
    DeploymentNotEmpty {
        /// Deployment id.
        id: String,
        /// Number of remaining resources.
        count: usize,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire deployment lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Deployment lock is held by another process.
    #[error("Deployment is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },
}

/// Provider API errors, classified by how callers should react.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Allow-listed provider error; safe to retry after a backoff.
    #[error("Transient provider error {code}: {message}")]
    Transient {
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },

    /// The object vanished out-of-band.
    #[error("{kind} '{id}' no longer exists on the provider")]
    Disappeared {
        /// Object kind.
        kind: String,
        /// Provider-assigned id.
        id: String,
    },

    /// Attempt to change an attribute that cannot change after creation.
    #[error("Cannot change {attribute} of '{resource}': {message}")]
    PreconditionViolation {
        /// Resource name.
        resource: String,
        /// Immutable attribute.
        attribute: String,
        /// Details.
        message: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Non-retryable API failure.
    #[error("Provider request failed: {status} {code} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from API.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Orchestration workflow errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A definition changed the type of an existing resource.
    #[error(
        "Resource '{name}' changed type from '{from}' to '{to}'; destroy it before recreating it with a new type"
    )]
    TypeChanged {
        /// Resource name.
        name: String,
        /// Persisted type.
        from: String,
        /// Type requested by the definition.
        to: String,
    },

    /// Resource has no definition in the current evaluation.
    #[error("No definition for resource '{name}'")]
    MissingDefinition {
        /// Resource name.
        name: String,
    },

    /// The build did not produce an artifact for a machine.
    #[error("Build output {path} has no artifact for machine '{machine}'")]
    MissingArtifact {
        /// Machine name.
        machine: String,
        /// Build output path.
        path: String,
    },

    /// The build collaborator failed.
    #[error("Build failed: {message}")]
    BuildFailed {
        /// Description of the failure.
        message: String,
    },

    /// A remote command exited unsuccessfully.
    #[error("Command on '{machine}' failed with status {status}: {command}")]
    RemoteCommandFailed {
        /// Machine name.
        machine: String,
        /// Command that failed.
        command: String,
        /// Exit status, -1 when killed by a signal.
        status: i32,
    },

    /// Machine has no address to reach it on.
    #[error("Machine '{machine}' has no reachable address")]
    Unreachable {
        /// Machine name.
        machine: String,
    },

    /// Requested generation was never recorded.
    #[error("Generation {generation} does not exist")]
    UnknownGeneration {
        /// Generation number.
        generation: u64,
    },

    /// Requested backup id is unknown.
    #[error("Backup {backup_id} does not exist")]
    UnknownBackup {
        /// Backup id.
        backup_id: String,
    },

    /// The operation is not supported by this resource type.
    #[error("{operation} is not supported by {type_tag} resource '{name}'")]
    Unsupported {
        /// Operation name.
        operation: String,
        /// Resource type tag.
        type_tag: String,
        /// Resource name.
        name: String,
    },

    /// Skipped because something it waits for failed.
    #[error("Resource '{name}' skipped: dependency '{dependency}' failed")]
    DependencyFailed {
        /// Skipped resource.
        name: String,
        /// The first failed dependency.
        dependency: String,
    },

    /// A worker panicked while running a task.
    #[error("Task '{task}' panicked: {message}")]
    TaskPanicked {
        /// Task name.
        task: String,
        /// Panic payload, when printable.
        message: String,
    },

    /// The operator declined or the workflow stopped early.
    #[error("Aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Several independent task failures from one scheduler phase.
#[derive(Debug)]
pub struct AggregateError {
    /// Task name paired with its error, in task order.
    pub failures: Vec<(String, DeployError)>,
}

/// Result type alias for statecraft operations.
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(what: impl Into<String>, waited_secs: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            waited_secs,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transient { .. } | ProviderError::Network { .. })
        )
    }

    /// Returns true if this error means the provider object is gone.
    #[must_use]
    pub const fn is_disappeared(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Disappeared { .. }))
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Builds the phase error for a set of failures: `None` when empty, the
    /// failure itself when there is exactly one, an aggregate otherwise.
    #[must_use]
    pub fn from_failures(mut failures: Vec<(String, Self)>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop().map(|(_, err)| err),
            _ => Some(Self::Aggregate(AggregateError { failures })),
        }
    }
}

impl AggregateError {
    /// Names of every failed task.
    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Always false; an aggregate holds at least two failures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} tasks failed:", self.failures.len())?;
        for (name, err) in &self.failures {
            writeln!(f, "  - {name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a disappeared error.
    #[must_use]
    pub fn disappeared(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Disappeared {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(message: &str) -> DeployError {
        DeployError::internal(message)
    }

    #[test]
    fn test_no_failures_is_no_error() {
        assert!(DeployError::from_failures(vec![]).is_none());
    }

    #[test]
    fn test_single_failure_is_returned_unchanged() {
        let err = DeployError::from_failures(vec![(String::from("a"), failure("boom"))])
            .expect("one failure yields an error");
        assert!(matches!(err, DeployError::Internal(ref m) if m == "boom"));
    }

    #[test]
    fn test_several_failures_are_aggregated() {
        let err = DeployError::from_failures(vec![
            (String::from("a"), failure("one")),
            (String::from("b"), failure("two")),
        ])
        .expect("failures yield an error");

        let DeployError::Aggregate(aggregate) = &err else {
            panic!("expected an aggregate error");
        };
        assert_eq!(aggregate.task_names(), vec!["a", "b"]);
        let rendered = aggregate.to_string();
        assert!(rendered.contains("a: Internal error: one"));
        assert!(rendered.contains("b: Internal error: two"));
    }

    #[test]
    fn test_retryable_classification() {
        let transient = DeployError::Provider(ProviderError::Transient {
            code: String::from("RequestLimitExceeded"),
            message: String::from("slow down"),
        });
        assert!(transient.is_retryable());

        let gone = DeployError::Provider(ProviderError::disappeared("vm", "i-1"));
        assert!(!gone.is_retryable());
        assert!(gone.is_disappeared());

        assert!(DeployError::timeout("vm to stop", 30).is_timeout());
    }
}
