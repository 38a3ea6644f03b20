//! Transport and codec error types

/// Outcome of parsing the front of a receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A complete, valid frame
    Frame(T),
    /// Inter-frame filler (line endings, whitespace), silently dropped
    Skip,
    /// Malformed bytes, dropped with a warning
    Invalid(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0} unexpected bytes before frame start")]
    Garbage(usize),

    #[error("invalid pulse prefix")]
    BadPrefix,

    #[error("invalid channel field")]
    BadChannel,

    #[error("missing ':' separator")]
    MissingSeparator,

    #[error("invalid sensor state byte {0:#04x}")]
    BadState(u8),

    #[error("invalid start byte {0:#04x}")]
    BadStartByte(u8),

    #[error("invalid checksum byte {0:#04x}")]
    BadChecksum(u8),

    #[error("unknown function code {0:#04x}")]
    UnknownFunction(u8),

    #[error("invalid hex command '{0}'")]
    InvalidHex(String),

    #[error("empty command frame")]
    EmptyCommand,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    Disconnected,

    #[error("write timed out")]
    WriteTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
