// Hyperhold - Rust Implementation
// Compressed secondary storage tier: extent allocator, LRU list engine and extent cache

#![warn(rust_2018_idioms)]

pub mod config;
pub mod tier;

// Re-exports for convenience
pub use config::TierConfig;
pub use tier::{Area, ExtentCache, Manager, Scenario};

/// Hyperhold error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Out of space: {0}")]
        OutOfSpace(String),

        #[error("No memory: {0}")]
        NoMemory(String),

        #[error("Busy: {0}")]
        Busy(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Already exists: {0}")]
        AlreadyExists(String),

        #[error("No eligible objects: {0}")]
        NoEligibleObjects(String),

        #[error("Codec error: {0}")]
        Codec(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        /// True for the "busy" concurrency-conflict signal
        pub fn is_busy(&self) -> bool {
            matches!(self, Error::Busy(_))
        }

        /// True when the target is absent (or was removed concurrently)
        pub fn is_not_found(&self) -> bool {
            matches!(self, Error::NotFound(_))
        }
    }

    impl From<::config::ConfigError> for Error {
        fn from(e: ::config::ConfigError) -> Self {
            Error::Config(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
