use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Record {hash} has no message entry")]
    MissingEntry { hash: String },

    #[error("Record {hash} has a malformed entry: {source}")]
    MalformedEntry {
        hash: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record {hash} has an out-of-range timestamp: {micros}")]
    InvalidTimestamp { hash: String, micros: i64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
