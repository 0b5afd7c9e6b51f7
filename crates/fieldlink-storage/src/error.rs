//! Errors raised by the device and history stores.

use thiserror::Error;

pub use fieldlink_core::error::Error as CoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem failure while creating or opening the database file.
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be encoded or decoded as JSON.
    #[error("record encoding: {0}")]
    Serialization(String),

    /// The embedded database rejected an operation.
    #[error("backend: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => CoreError::Storage(e.to_string()),
            Error::Serialization(s) => CoreError::Serialization(s),
            Error::Storage(s) => CoreError::Storage(s),
            Error::NotFound(s) => CoreError::NotFound(s),
            Error::InvalidInput(s) => CoreError::Validation(s),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Every redb failure collapses into `Storage`, tagged with the stage that failed.
macro_rules! redb_stage {
    ($($ty:ty => $stage:literal),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::Storage(format!("{}: {}", $stage, e))
                }
            }
        )*
    };
}

redb_stage! {
    redb::Error => "redb",
    redb::DatabaseError => "open database",
    redb::TransactionError => "begin transaction",
    redb::TableError => "open table",
    redb::StorageError => "read/write",
    redb::CommitError => "commit",
}
