//! The WebSocket session: opening handshake, data frames, control frames and close.

mod client;
mod state;
mod transport;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::AsyncWriteExt as _;
use tokio_util::codec::{Framed, FramedParts};

use crate::codec::{Opcode, WebsocketCodec, WebsocketFrame};
use crate::errors::ConnectionError;

pub use client::{Scheme, SessionBuilder, Target, WEBSOCKET_GUID, accept_key};
pub(crate) use client::SessionConfig;
pub use state::ConnectionState;
pub use transport::{BoxedStream, Connector, TcpConnector, WebSocketStream};

const MAX_CONTROL_PAYLOAD: usize = 125;

/// Callback receiving every data message a session reads.
pub type MessageCallback = Box<dyn FnMut(&WebsocketMessage) + Send>;

/// A data message read from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum WebsocketMessage {
    /// A string of text
    Text(String),
    /// A block of binary data
    Binary(Vec<u8>),
}

/// What reading one frame amounted to.
enum Event {
    Message(WebsocketMessage),
    Pong(Vec<u8>),
    /// A ping, answered with a pong.
    PingAnswered,
    /// The close exchange completed and the session is finished.
    Closed,
}

/// A client-side WebSocket session bound to one connection.
///
/// Operations take `&mut self` and run to completion on the owned stream: there is no
/// background reader, so control frames are only processed while a call is reading.
pub struct Session<C = TcpConnector> {
    target: Target,
    config: SessionConfig,
    connector: C,
    on_message: Option<MessageCallback>,
    state: ConnectionState,
    handshake_key: Option<String>,
    framed: Option<Framed<BoxedStream, WebsocketCodec>>,
    close_reason: Option<(CloseReason, String)>,
}

impl Session<TcpConnector> {
    /// Create a new builder for `uri`.
    ///
    /// The URI must use the `ws` or `wss` scheme and name a host. The port defaults to
    /// 80 or 443, the path to "/".
    pub fn builder(uri: http::Uri) -> SessionBuilder {
        SessionBuilder::new(uri)
    }
}

impl<C: Connector> Session<C> {
    pub(crate) fn from_parts(
        target: Target,
        config: SessionConfig,
        on_message: Option<MessageCallback>,
        connector: C,
    ) -> Self {
        Self {
            target,
            config,
            connector,
            on_message,
            state: ConnectionState::Idle,
            handshake_key: None,
            framed: None,
            close_reason: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Status code and reason of the close frame the peer sent, if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<(CloseReason, &str)> {
        self.close_reason
            .as_ref()
            .map(|(code, reason)| (*code, reason.as_str()))
    }

    /// Connect and perform the opening handshake.
    ///
    /// `resource` overrides the path and query of the target URI for this request.
    ///
    /// Returns `Ok(false)` without touching the network if a handshake was already
    /// attempted on this session and did not complete. On any handshake failure the
    /// session stays in `Connecting`.
    ///
    /// # Errors
    /// Returns `HandshakeRejected` for a non-101 answer, `HandshakeValidationFailed`
    /// naming the offending header, or the transport error that interrupted the exchange.
    pub async fn open(&mut self, resource: Option<&str>) -> Result<bool, ConnectionError> {
        if self.state == ConnectionState::Connecting {
            tracing::warn!("open called while a handshake is pending or has failed");
            return Ok(false);
        }
        self.state.transition(ConnectionState::Connecting)?;

        let resource = resource.unwrap_or(self.target.resource()).to_owned();
        let key = self.handshake_key.insert(client::generate_key()).clone();
        let request = client::build_request(&self.target, &resource, &key, &self.config)?;

        let mut stream = self.connector.connect(&self.target).await?;
        tracing::debug!(host = self.target.host(), resource = %resource, "sending opening handshake");
        let (response, leftover) = transport::send_request(&mut stream, &request).await?;
        client::validate_handshake_response(response, &key)?;

        let mut parts = FramedParts::new::<WebsocketFrame>(
            stream,
            WebsocketCodec::new(self.config.max_message_size),
        );
        parts.read_buf = leftover;
        self.framed = Some(Framed::from_parts(parts));
        self.state.transition(ConnectionState::Connected)?;
        tracing::debug!(host = self.target.host(), "websocket session established");
        Ok(true)
    }

    /// Send one unfragmented text frame.
    ///
    /// # Errors
    /// Returns `NotConnected` outside the `Connected` state, or the write error.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.send_frame(Opcode::Text, text.as_bytes().to_vec()).await
    }

    /// Send one unfragmented binary frame.
    ///
    /// # Errors
    /// Returns `NotConnected` outside the `Connected` state, or the write error.
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.send_frame(Opcode::Binary, data.to_vec()).await
    }

    /// Read until the next data message arrives.
    ///
    /// Pings read on the way are answered, pongs are discarded. Returns `Ok(None)` once
    /// the peer's close frame has been handled and the session is finished.
    ///
    /// # Errors
    /// Returns `Closed` if the transport ends without a close frame, a codec error for
    /// malformed or fragmented frames, or `ProtocolViolation`.
    pub async fn receive_message(&mut self) -> Result<Option<WebsocketMessage>, ConnectionError> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Closing
        ) {
            return Err(ConnectionError::NotConnected(self.state));
        }
        loop {
            match self.next_event().await? {
                Event::Message(message) => return Ok(Some(message)),
                Event::Closed => return Ok(None),
                Event::Pong(_) | Event::PingAnswered => {}
            }
        }
    }

    /// Send a ping and wait for the pong, returning its payload.
    ///
    /// Data messages read while waiting go to the message callback only.
    ///
    /// # Errors
    /// Returns `ProtocolViolation` for payloads over 125 bytes, `Closed` if the peer
    /// closes before answering, or any read/write error.
    pub async fn ping(&mut self, payload: Option<&[u8]>) -> Result<Vec<u8>, ConnectionError> {
        self.ensure_connected()?;
        let payload = payload.unwrap_or_default();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ConnectionError::ProtocolViolation(
                "Control frame payload exceeds 125 bytes",
            ));
        }
        self.send_frame(Opcode::Ping, payload.to_vec()).await?;
        loop {
            match self.next_event().await? {
                Event::Pong(payload) => return Ok(payload),
                Event::Closed => return Err(ConnectionError::Closed),
                Event::Message(_) | Event::PingAnswered => {}
            }
        }
    }

    /// Send a close frame (status 1000) and wait for the peer's.
    ///
    /// The wait is bounded by the configured close timeout; when it runs out the session
    /// is finished anyway. Calling `close` on a finished session does nothing.
    ///
    /// # Errors
    /// Returns `NotConnected` before the session is open, or a read/write error hit
    /// during the exchange. The session is finished in every case.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Finished => return Ok(()),
            ConnectionState::Connected => {}
            state => return Err(ConnectionError::NotConnected(state)),
        }

        let payload = u16::from(CloseReason::NormalClosure).to_be_bytes().to_vec();
        if let Err(e) = self.send_close_frame(payload).await {
            self.finish().await?;
            return Err(e);
        }

        match tokio::time::timeout(self.config.close_timeout, self.await_peer_close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.finish().await?;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.config.close_timeout,
                    "peer did not acknowledge close; finishing"
                );
                self.finish().await
            }
        }
    }

    async fn await_peer_close(&mut self) -> Result<(), ConnectionError> {
        loop {
            if let Event::Closed = self.next_event().await? {
                return Ok(());
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected(self.state))
        }
    }

    async fn send_frame(&mut self, opcode: Opcode, payload: Vec<u8>) -> Result<(), ConnectionError> {
        let framed = self
            .framed
            .as_mut()
            .ok_or(ConnectionError::NotConnected(self.state))?;
        tracing::debug!(?opcode, len = payload.len(), "sending frame");
        framed.send(WebsocketFrame::new(opcode, payload)).await?;
        Ok(())
    }

    async fn send_close_frame(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.send_frame(Opcode::Close, payload).await?;
        self.state.transition(ConnectionState::Closing)
    }

    /// Read one frame and act on it.
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        let framed = self
            .framed
            .as_mut()
            .ok_or(ConnectionError::NotConnected(self.state))?;
        let Some(frame) = framed.next().await.transpose()? else {
            let clean = self.state == ConnectionState::Closing;
            tracing::debug!(clean, "transport ended");
            self.finish().await?;
            return if clean {
                Ok(Event::Closed)
            } else {
                Err(ConnectionError::Closed)
            };
        };
        tracing::debug!(opcode = ?frame.opcode, len = frame.payload.len(), "received frame");

        if frame.opcode.is_control() {
            return self.handle_control_frame(frame).await;
        }

        let message = data_message(frame)?;
        if let Some(callback) = self.on_message.as_mut() {
            callback(&message);
        }
        Ok(Event::Message(message))
    }

    async fn handle_control_frame(
        &mut self,
        frame: WebsocketFrame,
    ) -> Result<Event, ConnectionError> {
        if frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ConnectionError::ProtocolViolation(
                "Control frame payload exceeds 125 bytes",
            ));
        }
        match frame.opcode {
            Opcode::Close => {
                let echo = match parse_close_payload(&frame.payload)? {
                    Some((code, reason)) => {
                        tracing::debug!(code, reason = %reason, "peer sent close frame");
                        self.close_reason = Some((CloseReason::from(code), reason));
                        code.to_be_bytes().to_vec()
                    }
                    None => Vec::new(),
                };
                // Peer-initiated: acknowledge before finishing.
                let echoed = if self.state == ConnectionState::Closing {
                    Ok(())
                } else {
                    self.send_close_frame(echo).await
                };
                self.finish().await?;
                echoed.map(|()| Event::Closed)
            }
            Opcode::Ping => {
                self.send_frame(Opcode::Pong, frame.payload).await?;
                Ok(Event::PingAnswered)
            }
            Opcode::Pong => Ok(Event::Pong(frame.payload)),
            other => {
                tracing::warn!(opcode = u8::from(other), "unhandled control opcode");
                Err(ConnectionError::ProtocolViolation("Unhandled opcode"))
            }
        }
    }

    /// Shut the stream down and mark the session finished.
    async fn finish(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut framed) = self.framed.take()
            && let Err(e) = framed.get_mut().shutdown().await
        {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
        if self.state == ConnectionState::Finished {
            return Ok(());
        }
        self.state.transition(ConnectionState::Finished)
    }
}

fn data_message(frame: WebsocketFrame) -> Result<WebsocketMessage, ConnectionError> {
    match frame.opcode {
        Opcode::Text => String::from_utf8(frame.payload)
            .map(WebsocketMessage::Text)
            .map_err(|_| ConnectionError::ProtocolViolation("Invalid UTF-8 in text frame")),
        Opcode::Binary => Ok(WebsocketMessage::Binary(frame.payload)),
        Opcode::Continuation => Err(ConnectionError::ProtocolViolation(
            "Continuation frame without initial data frame",
        )),
        other => {
            tracing::warn!(opcode = u8::from(other), "unhandled data opcode");
            Err(ConnectionError::ProtocolViolation("Unhandled opcode"))
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<Option<(u16, String)>, ConnectionError> {
    match payload {
        [] => Ok(None),
        [_] => Err(ConnectionError::ProtocolViolation(
            "Close frame payload of one byte",
        )),
        [hi, lo, reason @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            Ok(Some((code, String::from_utf8_lossy(reason).into_owned())))
        }
    }
}

/// WebSocket close status codes (RFC 6455 §7.4.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 1000
    NormalClosure,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    UnsupportedData,
    /// 1007
    InvalidPayloadData,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    InternalServerError,
    /// Any other code the peer chose.
    Other(u16),
}

impl From<u16> for CloseReason {
    fn from(value: u16) -> Self {
        match value {
            1000 => CloseReason::NormalClosure,
            1001 => CloseReason::GoingAway,
            1002 => CloseReason::ProtocolError,
            1003 => CloseReason::UnsupportedData,
            1007 => CloseReason::InvalidPayloadData,
            1008 => CloseReason::PolicyViolation,
            1009 => CloseReason::MessageTooBig,
            1010 => CloseReason::MandatoryExtension,
            1011 => CloseReason::InternalServerError,
            other => CloseReason::Other(other),
        }
    }
}

impl From<CloseReason> for u16 {
    fn from(value: CloseReason) -> Self {
        match value {
            CloseReason::NormalClosure => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::ProtocolError => 1002,
            CloseReason::UnsupportedData => 1003,
            CloseReason::InvalidPayloadData => 1007,
            CloseReason::PolicyViolation => 1008,
            CloseReason::MessageTooBig => 1009,
            CloseReason::MandatoryExtension => 1010,
            CloseReason::InternalServerError => 1011,
            CloseReason::Other(code) => code,
        }
    }
}

#[cfg(test)]
mod tests;
