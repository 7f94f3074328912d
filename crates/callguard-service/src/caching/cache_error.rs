use std::io;

use thiserror::Error;

use crate::error::FailureKind;

/// A failure of the persistent cache tier.
///
/// These errors are logged and turned into cache misses or skipped writes. They never reach
/// callers of the [`CallAdapter`](crate::adapter::CallAdapter).
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the cache directory failed.
    #[error("cache i/o failed")]
    Io(#[from] io::Error),
    /// A cache file exists but cannot be interpreted as an entry.
    #[error("malformed cache entry: {0}")]
    Malformed(String),
}

impl CacheError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Cache
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Runs `f`, treating a missing file as `None`.
pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        let malformed = CacheError::Malformed("missing header line".into());
        assert_eq!(malformed.kind(), FailureKind::Cache);
        assert_eq!(malformed.kind().as_str(), "cache");

        let io = CacheError::from(io::Error::other("disk full"));
        assert_eq!(io.kind(), FailureKind::Cache);
    }
}
