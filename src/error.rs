use std::io;
use thiserror::Error;

/// Errors surfaced by streams, the listener and dialing. Malformed packets never reach the
///  application; `InvalidHeader` is used internally by the codec and for routing decisions.
#[derive(Debug, Error)]
pub enum UtpError {
    #[error("i/o timeout")]
    Timeout,
    #[error("use of closed connection")]
    Closed,
    #[error("peer reset")]
    Reset,
    #[error("timed out waiting for ack")]
    AckTimeout,
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("no free connection id available")]
    ConnectionExhausted,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UtpResult<T> = Result<T, UtpError>;

impl UtpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UtpError::Timeout)
    }

    /// A temporary error leaves the connection intact, and the operation may be retried
    pub fn is_temporary(&self) -> bool {
        self.is_timeout()
    }

    /// Connection-level errors are stored once and handed out to every blocked caller, so they
    ///  need to be reproducible
    pub(crate) fn duplicate(&self) -> UtpError {
        match self {
            UtpError::Timeout => UtpError::Timeout,
            UtpError::Closed => UtpError::Closed,
            UtpError::Reset => UtpError::Reset,
            UtpError::AckTimeout => UtpError::AckTimeout,
            UtpError::InvalidHeader(msg) => UtpError::InvalidHeader(msg.clone()),
            UtpError::ConnectionExhausted => UtpError::ConnectionExhausted,
            UtpError::Io(e) => UtpError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<UtpError> for io::Error {
    fn from(value: UtpError) -> Self {
        let kind = match &value {
            UtpError::Timeout => io::ErrorKind::TimedOut,
            UtpError::Closed => io::ErrorKind::NotConnected,
            UtpError::Reset | UtpError::AckTimeout => io::ErrorKind::ConnectionReset,
            UtpError::InvalidHeader(_) => io::ErrorKind::InvalidData,
            UtpError::ConnectionExhausted => io::ErrorKind::AddrInUse,
            UtpError::Io(e) => return io::Error::new(e.kind(), e.to_string()),
        };
        io::Error::new(kind, value)
    }
}
