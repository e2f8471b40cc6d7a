#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sled failure: {0}")]
    Sled(#[from] sled::Error),
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("store lock poisoned by a panicking writer")]
    Poisoned,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("timestamp out of range: {0}")]
    TimeOutOfRange(String),
    #[error("write staged in both lanes: {0}")]
    LaneConflict(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing actor credentials")]
    MissingCredentials,
    #[error("unknown actor credentials")]
    UnknownCredentials,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub(crate) fn encode_err<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Encode(err.to_string())
}

/// Keys are normally UTF-8; anything else is reported as hex.
pub(crate) fn decode_err<E: std::fmt::Display>(key: &[u8], err: E) -> StoreError {
    StoreError::Decode {
        key: std::str::from_utf8(key).map_or_else(|_| hex::encode(key), str::to_string),
        reason: err.to_string(),
    }
}
