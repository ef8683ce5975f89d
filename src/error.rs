use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// No pooled connection could be handed out in time.
    PoolExhausted(String),
    /// The engine refused to open the database file.
    DatabaseOpen(String),
    /// Another process holds the database file. Never auto-deleted.
    DatabaseAlreadyOpen(String),
    /// The file failed to open for a reason other than a peer lock.
    CorruptDatabase(String),
    SpatialIndex(String),
    Trim(String),
    Sql {
        statement: String,
        source: rusqlite::Error,
    },
    Encode(&'static str, String),
    Decode(&'static str, String),
    LockError(io::Error),
    InvalidOperation(String),
    InvalidState(String),
}

impl Error {
    /// Wraps an engine error with the statement that produced it.
    pub fn sql(statement: impl Into<String>, source: rusqlite::Error) -> Self {
        Error::Sql {
            statement: statement.into(),
            source,
        }
    }

    /// Returns true for failures that belong to the connection layer.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted(_)
                | Error::DatabaseOpen(_)
                | Error::DatabaseAlreadyOpen(_)
                | Error::CorruptDatabase(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sql {
            statement: String::new(),
            source: err,
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::PoolExhausted(err.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::PoolExhausted(msg) => write!(f, "Connection pool exhausted: {}", msg),
            Error::DatabaseOpen(msg) => write!(f, "Failed to open database: {}", msg),
            Error::DatabaseAlreadyOpen(msg) => {
                write!(f, "Database already open by another process: {}", msg)
            }
            Error::CorruptDatabase(msg) => write!(f, "Corrupt database: {}", msg),
            Error::SpatialIndex(msg) => write!(f, "Spatial index error: {}", msg),
            Error::Trim(msg) => write!(f, "Trim error: {}", msg),
            Error::Sql { statement, source } if statement.is_empty() => {
                write!(f, "SQL error: {}", source)
            }
            Error::Sql { statement, source } => {
                write!(f, "SQL error: {} [statement: {}]", source, statement)
            }
            Error::Encode(field, msg) => write!(f, "Failed to encode {}: {}", field, msg),
            Error::Decode(field, msg) => write!(f, "Failed to decode {}: {}", field, msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) => Some(err),
            Error::Sql { source, .. } => Some(source),
            _ => None,
        }
    }
}
