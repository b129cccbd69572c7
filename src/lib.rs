//! Client-side WebSocket protocol engine (RFC 6455).
//!
//! A [`Session`] owns one connection. [`Session::open`] performs the HTTP Upgrade
//! handshake over it, after which the same stream carries masked client frames out and
//! server frames in. Ping, pong and close frames are handled by the session itself while
//! it reads; data messages are returned to the caller and, if registered, passed to a
//! message callback.
//!
//! Every message is a single frame: fragmented messages, extensions and sub-protocol
//! selection are not supported and fail the connection when a server uses them.
//!
//! ```no_run
//! # async fn demo() -> Result<(), ws_session::ConnectionError> {
//! use ws_session::Session;
//!
//! let mut session = Session::builder(http::Uri::from_static("ws://localhost:9001/")).build()?;
//! session.open(None).await?;
//! session.send_text("hello").await?;
//! let reply = session.receive_message().await?;
//! session.close().await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```
pub(crate) mod codec;
pub(crate) mod connection;
pub(crate) mod errors;

pub use connection::{
    BoxedStream, CloseReason, ConnectionState, Connector, MessageCallback, Scheme, Session,
    SessionBuilder, Target, TcpConnector, WEBSOCKET_GUID, WebSocketStream, WebsocketMessage,
    accept_key,
};
pub use errors::{ConnectionError, WebsocketCodecError};
pub use tokio_rustls::rustls;
