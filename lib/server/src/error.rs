//! Construction-time errors.

/// Error raised when a server or throttling configuration cannot be turned
/// into a running component. Always fatal at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid rate: {0}")]
    InvalidRate(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("max keys must be greater than 0")]
    InvalidMaxKeys,

    #[error("in-flight limit must be greater than 0")]
    InvalidInFlightLimit,

    #[error("rule #{rule}: unknown {kind} zone {zone:?}")]
    UnresolvedZone {
        rule: usize,
        kind: &'static str,
        zone: String,
    },

    #[error("key type {key_type:?} requires headerName")]
    MissingHeaderName { key_type: String },

    #[error("key type \"identity\" requires an identity key extractor")]
    MissingIdentityExtractor,

    #[error("key type \"custom\" requires a custom key extractor")]
    MissingCustomExtractor,

    #[error("either address or unixSocketPath must be configured")]
    MissingAddress,

    #[error("keepalive minTime must not exceed keepalive time")]
    InvalidKeepalive,

    #[error("TLS is enabled but certificate or key path is empty")]
    InvalidTls,
}
