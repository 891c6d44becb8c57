use podipam_trace::error::TraceableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Failed to get lock")]
    Lock,

    #[error("Codec: {0}")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Corrupted tombstone: {0}")]
    CorruptedTombstone(String),

    #[error("Database: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit: {0}")]
    Commit(#[from] redb::CommitError),
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Lock => "lock",
            Error::Codec(_) => "codec",
            Error::CorruptedTombstone(_) => "corrupted_tombstone",
            Error::Database(_)
            | Error::Transaction(_)
            | Error::Table(_)
            | Error::Storage(_)
            | Error::Commit(_) => "database",
        }
        .to_string()
    }
}
