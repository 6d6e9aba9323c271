use std::fmt;
use std::panic::Location;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request line.
    Parse,
    /// Command issued in the wrong connection/transaction state.
    State,
    /// Argument could not be bound to its declared parameter type.
    Bind,
    /// The database rejected or failed the statement.
    Execution,
    /// Statement exceeded the configured timeout.
    Timeout,
    /// No pooled connection became available in time.
    ConnectTimeout,
    /// The underlying connection is gone.
    Closed,
}

/// A failure attributed to a connection and, when relevant, a query.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub conn: Option<i32>,
    pub query: Option<String>,
    pub message: String,
    pub detail: Option<String>,
}

impl GatewayError {
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let detail = Some(format!("{kind:?}: {message} at {}", Location::caller()));
        Self {
            kind,
            conn: None,
            query: None,
            message,
            detail,
        }
    }

    #[track_caller]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    #[track_caller]
    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message)
    }

    #[track_caller]
    pub fn bind(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bind, message)
    }

    pub fn query_timeout() -> Self {
        Self::bare(ErrorKind::Timeout, "Query read timeout")
    }

    pub fn connect_timeout() -> Self {
        Self::bare(ErrorKind::ConnectTimeout, "timeout exceeded when trying to connect")
    }

    #[cfg(test)]
    pub fn closed() -> Self {
        Self::bare(ErrorKind::Closed, "closed")
    }

    /// Wraps a foreign error, keeping its debug rendering as the diagnostic.
    /// An error with an empty message falls back to its type name.
    #[track_caller]
    pub fn from_error<E>(kind: ErrorKind, err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut message = err.to_string();
        if message.trim().is_empty() {
            message = std::any::type_name::<E>().to_string();
        }
        let mut detail = format!("{err:?}");
        let mut source = err.source();
        while let Some(cause) = source {
            detail.push_str(&format!(" caused by: {cause}"));
            source = cause.source();
        }
        detail.push_str(&format!(" at {}", Location::caller()));
        Self {
            kind,
            conn: None,
            query: None,
            message,
            detail: Some(detail),
        }
    }

    fn bare(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            conn: None,
            query: None,
            message: message.to_string(),
            detail: None,
        }
    }

    /// Attributes the error to a connection unless it already names one.
    pub fn with_conn(mut self, conn: i32) -> Self {
        self.conn.get_or_insert(conn);
        self
    }

    /// Attributes the error to a query unless it already names one.
    pub fn with_query(mut self, query: &str) -> Self {
        if self.query.is_none() {
            self.query = Some(query.to_string());
        }
        self
    }

    /// Whether a diagnostic line accompanies the error line.
    pub fn traced(&self) -> bool {
        !matches!(self.kind, ErrorKind::Timeout | ErrorKind::ConnectTimeout)
    }
}

/// Maps a driver error, singling out a connection that has gone away.
///
/// Server-side SQL errors never count as closed even if their text mentions
/// the word; a client-side error does when it says so.
#[track_caller]
pub fn driver_error(err: &tokio_postgres::Error) -> GatewayError {
    let closed = err.is_closed()
        || (err.as_db_error().is_none() && err.to_string().to_lowercase().contains("closed"));
    let kind = if closed {
        ErrorKind::Closed
    } else {
        ErrorKind::Execution
    };
    GatewayError::from_error(kind, err)
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::State => "state",
            ErrorKind::Bind => "bind",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectTimeout => "connect timeout",
            ErrorKind::Closed => "closed",
        };
        f.write_str(name)
    }
}
