/// A type alias for handling errors throughout poplod
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Null or zero-sized vertex/index arrays passed to `cache()`.
    #[error("invalid input: {0}")]
    InvalidInput(std::borrow::Cow<'static, str>),

    /// `init(key)` when the hash directory does not exist.
    #[error("no cache entry for key {0:016x}")]
    CacheAbsent(u64),

    /// The `format` marker file is missing or holds an unrecognized version.
    #[error("cache format incompatible: {0}")]
    CacheIncompatible(String),

    /// A required cache file exists but is truncated or internally
    /// inconsistent.
    #[error("cache corrupt: {0}")]
    CacheCorrupt(String),

    /// An unexpected I/O error occurred reading or writing the cache.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[inline]
    pub(crate) fn invalid_input(msg: &'static str) -> Self {
        Self::InvalidInput(std::borrow::Cow::Borrowed(msg))
    }
}
