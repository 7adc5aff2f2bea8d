/// Why a forwarded request failed inside the proxy. Carried from the backend
/// task to every waiting reply slot, so it must be `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// No live server, or the connect was refused.
    Refused,
    /// The per-request deadline expired.
    Timeout,
    /// The server half-closed with requests outstanding.
    Eof,
    /// Transport error on the server connection.
    Reset,
    /// The server response failed to parse.
    Invalid,
}

impl Failure {
    /// Reason text of the synthesized client-facing error line.
    pub fn reason(&self) -> &'static str {
        match self {
            Failure::Refused => "Connection refused",
            Failure::Timeout => "Connection timed out",
            Failure::Eof => "Connection reset by peer",
            Failure::Reset => "Connection reset by peer",
            Failure::Invalid => "Invalid argument",
        }
    }
}

/// Engine-level errors that terminate a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] proto::ParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
