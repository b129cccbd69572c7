//! Error types for the ws-session crate.

use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors produced by the frame codec (framing, masking, IO).
#[derive(Debug, Error)]
pub enum WebsocketCodecError {
    /// An underlying I/O error occurred while reading or writing frames.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    /// An inbound frame had its FIN bit cleared. Fragmented messages are not supported.
    #[error("Fragmented frames are not supported")]
    FragmentationUnsupported,
    /// The outbound payload cannot be described by a 64-bit length field.
    #[error("Unsupported payload size: {0} bytes")]
    UnsupportedPayloadSize(usize),
    /// An inbound frame announced a payload larger than the configured limit.
    #[error("Message too big: {0} bytes")]
    MessageTooBig(u64),
    /// The frame header violated the wire format.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

/// Errors produced by the session, its handshake and its transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// An error occurred in the frame codec.
    #[error("Codec error: {0}")]
    Codec(#[from] WebsocketCodecError),
    /// The server answered the opening handshake with something other than `101`.
    #[error("Handshake rejected with status {}", .0.status())]
    HandshakeRejected(Box<http::Response<()>>),
    /// A `101` response failed one of the header checks; the field names the header.
    #[error("Handshake validation failed: {0} header")]
    HandshakeValidationFailed(&'static str),
    /// The peer violated the WebSocket protocol.
    #[error("WebSocket protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// The provided URI is invalid.
    #[error("Invalid URI: {0}")]
    InvalidUri(&'static str),
    /// The operation requires an open session.
    #[error("Session is not connected (state: {0})")]
    NotConnected(ConnectionState),
    /// The state machine refused a transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// State the session was in.
        from: ConnectionState,
        /// State that was requested.
        to: ConnectionState,
    },
    /// The transport ended without a close handshake.
    #[error("WebSocket closed")]
    Closed,
    /// Failed to connect to the server.
    #[error("Failed to connect to server: {0}")]
    ConnectFailed(std::io::Error),
    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(std::io::Error),
    /// The DNS name for TLS was invalid.
    #[error("Invalid DNS name for TLS")]
    InvalidDnsName,
    /// Failed to build the handshake request.
    #[error("Failed to build handshake request")]
    BuildHandshakeFailed,
    /// Failed to write the handshake request to the server.
    #[error("Failed to write handshake request: {0}")]
    WriteHandshakeFailed(std::io::Error),
    /// Failed to read the handshake response from the server. A stream that ends before
    /// the response head is complete reports `UnexpectedEof`.
    #[error("Failed to read handshake response: {0}")]
    ReadHandshakeFailed(std::io::Error),
    /// The handshake response head exceeded the size limit.
    #[error("Handshake response too large")]
    HandshakeResponseTooLarge,
    /// Failed to parse the handshake response.
    #[error("Failed to parse handshake response")]
    ParseHandshakeFailed,
    /// The handshake response had an invalid status code, header name or header value.
    #[error("Malformed handshake response")]
    MalformedHandshakeResponse,
}
