use thiserror::Error;

/// Failures of the persistence layer itself.
///
/// A conditional update that simply does not match is not an error; it is
/// reported as `false` / `None` by the [`Store`](super::Store) methods.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("BSON decoding error: {0}")]
    Decode(#[from] mongodb::bson::de::Error),

    #[error("store call timed out")]
    Timeout,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        assert_eq!(StoreError::Timeout.to_string(), "store call timed out");
    }

    #[test]
    fn corrupt_display() {
        let err = StoreError::Corrupt("bad date".into());
        assert_eq!(err.to_string(), "corrupt record: bad date");
    }
}
