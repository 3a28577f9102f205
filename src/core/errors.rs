use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the coordination engine
#[derive(Debug, Error)]
pub enum ScoutError {
    /// Another live identity already holds this display name
    #[error("Name in use: {name} (owner: {owner_id})")]
    NameInUse {
        name: String,
        owner_id: String,
        last_active: Option<i64>,
    },

    /// A match is already running
    #[error("Match already active: {match_id}")]
    MatchAlreadyActive { match_id: String },

    /// Start requested with nobody waiting
    #[error("Queue is empty")]
    QueueEmpty,

    /// A stale conflicting identity could not be removed, so the login is blocked
    #[error("Failed to evict stale identity {identity_id} holding {name}")]
    EvictionFailed {
        identity_id: String,
        name: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Input validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Record missing from the store
    #[error("Not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    /// Shared state store failures (network, backend)
    #[error("Store operation failed: {operation} at {path}")]
    Store {
        operation: String,
        path: String,
        context: HashMap<String, String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication provider rejected the request
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Authentication provider cannot be reached
    #[error("Authentication provider unavailable: {message}")]
    AuthUnavailable { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ScoutError {
    pub fn name_in_use<N: Into<String>, O: Into<String>>(
        name: N,
        owner_id: O,
        last_active: Option<i64>,
    ) -> Self {
        Self::NameInUse {
            name: name.into(),
            owner_id: owner_id.into(),
            last_active,
        }
    }

    pub fn match_already_active<S: Into<String>>(match_id: S) -> Self {
        Self::MatchAlreadyActive {
            match_id: match_id.into(),
        }
    }

    pub fn eviction_failed<I: Into<String>, N: Into<String>>(
        identity_id: I,
        name: N,
        source: Option<ScoutError>,
    ) -> Self {
        Self::EvictionFailed {
            identity_id: identity_id.into(),
            name: name.into(),
            source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found<K: Into<String>, I: Into<String>>(kind: K, id: I) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a store error without an underlying cause
    pub fn store<O: Into<String>, P: Into<String>>(operation: O, path: P) -> Self {
        Self::Store {
            operation: operation.into(),
            path: path.into(),
            context: HashMap::new(),
            source: None,
        }
    }

    /// Add context to a store error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Store { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn auth_unavailable<S: Into<String>>(message: S) -> Self {
        Self::AuthUnavailable {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a named field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a database error
    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Conflicts are surfaced to the caller and never retried
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::NameInUse { .. }
                | Self::MatchAlreadyActive { .. }
                | Self::QueueEmpty
                | Self::EvictionFailed { .. }
        )
    }

    /// Check if error may go away on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store { .. } | Self::Io { .. } => true,
            Self::Database { .. } => true,
            Self::AuthUnavailable { .. } => true,
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NameInUse { .. }
            | Self::MatchAlreadyActive { .. }
            | Self::QueueEmpty
            | Self::EvictionFailed { .. } => "conflict",
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Store { .. } => "store",
            Self::Auth { .. } => "auth",
            Self::AuthUnavailable { .. } => "degraded",
            Self::Configuration { .. } => "configuration",
            Self::Database { .. } => "database",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }

    /// Human-readable message safe to show to an operator.
    ///
    /// Store internals never leak through here.
    pub fn user_message(&self) -> String {
        match self {
            Self::NameInUse { name, .. } => {
                format!("The name \"{}\" is already active elsewhere.", name)
            }
            Self::EvictionFailed { name, .. } => format!(
                "The name \"{}\" is still held by an old session. Please try again shortly.",
                name
            ),
            Self::MatchAlreadyActive { .. } => "Another match is already running.".to_string(),
            Self::QueueEmpty => "No scouts are waiting in the queue.".to_string(),
            Self::Validation { message, .. } => message.clone(),
            Self::Auth { .. } => "Login failed. Incorrect email or password.".to_string(),
            _ => "Something went wrong, please try again.".to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ScoutError>;

impl From<std::io::Error> for ScoutError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ScoutError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ScoutError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for ScoutError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}
