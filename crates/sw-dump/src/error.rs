use thiserror::Error;

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Dumped record not found: {0}")]
    NotFound(i64),

    #[error("Corrupt dumped record {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for DumpError {
    fn from(e: sqlx::Error) -> Self {
        DumpError::Database(e.to_string())
    }
}
