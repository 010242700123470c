/// Domain-specific error types for the journal service.
/// Data-quality problems never land here -- the calculators degrade to
/// None per field. These cover the repository, configuration, and the
/// import boundary.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("import error: {0}")]
    Import(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl From<rusqlite::Error> for JournalError {
    fn from(e: rusqlite::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Parse(e.to_string())
    }
}

impl From<csv::Error> for JournalError {
    fn from(e: csv::Error) -> Self {
        JournalError::Import(e.to_string())
    }
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

pub type JournalResult<T> = Result<T, JournalError>;
