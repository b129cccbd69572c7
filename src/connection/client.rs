use std::str::FromStr;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as base64;
use http::{HeaderValue, Request, Response, StatusCode};

use crate::connection::transport::{Connector, TcpConnector};
use crate::connection::{MessageCallback, Session, WebsocketMessage};
use crate::errors::ConnectionError;

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const SEC_WEBSOCKET_KEY_LEN: usize = 16;
const WEBSOCKET_VERSION: &str = "13";

const HEADER_UPGRADE: &str = "Upgrade";
const HEADER_CONNECTION: &str = "Connection";
const HEADER_ACCEPT: &str = "Sec-WebSocket-Accept";
const HEADER_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
const HEADER_PROTOCOL: &str = "Sec-WebSocket-Protocol";

pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }
}

/// A validated `ws://` or `wss://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    host: String,
    port: u16,
    resource: String,
}

impl Target {
    /// Validate `uri` as a WebSocket endpoint.
    ///
    /// The scheme must be `ws` or `wss` and a host is required. The port defaults to 80
    /// or 443 and the resource to `/`; a query string is kept as part of the resource.
    ///
    /// # Errors
    /// Returns `InvalidUri` naming the first problem found.
    pub fn from_uri(uri: &http::Uri) -> Result<Self, ConnectionError> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("ws") => Scheme::Ws,
            Some(s) if s.eq_ignore_ascii_case("wss") => Scheme::Wss,
            Some("http") => {
                return Err(ConnectionError::InvalidUri(
                    "http scheme is not supported for WebSocket",
                ));
            }
            Some("https") => {
                return Err(ConnectionError::InvalidUri(
                    "https scheme is not supported for WebSocket",
                ));
            }
            Some(_) => {
                return Err(ConnectionError::InvalidUri(
                    "unsupported URI scheme for WebSocket",
                ));
            }
            None => return Err(ConnectionError::InvalidUri("missing URI scheme")),
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or(ConnectionError::InvalidUri("missing host"))?
            .to_owned();
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        let resource = uri
            .path_and_query()
            .map(http::uri::PathAndQuery::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_owned();

        Ok(Self {
            scheme,
            host,
            port,
            resource,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path and query sent in the request line unless `open` overrides it.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Wss
    }

    fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Target {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: http::Uri = s
            .parse()
            .map_err(|_| ConnectionError::InvalidUri("unparseable URI"))?;
        Self::from_uri(&uri)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) sub_protocols: Vec<String>,
    pub(crate) close_timeout: Duration,
    pub(crate) max_message_size: usize,
    pub(crate) origin: Option<String>,
    pub(crate) auth_header: Option<String>,
    pub(crate) cookies: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sub_protocols: Vec::new(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            origin: None,
            auth_header: None,
            cookies: Vec::new(),
        }
    }
}

/// Builder for a [`Session`]. Nothing touches the network until [`Session::open`].
pub struct SessionBuilder<C = TcpConnector> {
    uri: http::Uri,
    config: SessionConfig,
    on_message: Option<MessageCallback>,
    connector: C,
}

impl SessionBuilder<TcpConnector> {
    pub(crate) fn new(uri: http::Uri) -> Self {
        Self {
            uri,
            config: SessionConfig::default(),
            on_message: None,
            connector: TcpConnector::new(),
        }
    }
}

impl<C> SessionBuilder<C> {
    #[must_use]
    /// Add a sub-protocol to offer in the opening handshake.
    ///
    /// The list is only offered: a server that selects one of them fails the handshake,
    /// since the session has no way to act on the choice.
    pub fn add_sub_protocol<S: Into<String>>(mut self, protocol: S) -> Self {
        self.config.sub_protocols.push(protocol.into());
        self
    }

    #[must_use]
    /// Register a callback invoked with every data message the session reads, including
    /// those read while waiting for a pong or a close acknowledgement.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&WebsocketMessage) + Send + 'static,
    {
        self.on_message = Some(Box::new(callback));
        self
    }

    #[must_use]
    /// How long `close` waits for the peer's close frame. Defaults to 10 seconds.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    #[must_use]
    /// Largest inbound payload accepted. Defaults to 64 MiB.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    #[must_use]
    /// Set the Origin header for the opening handshake.
    pub fn origin<S: AsRef<str>>(mut self, value: S) -> Self {
        self.config.origin = Some(value.as_ref().to_string());
        self
    }

    #[must_use]
    /// Set the Authorization header for the opening handshake.
    ///
    /// The value is sent verbatim (e.g., "Bearer <token>") and never logged.
    pub fn auth_header<S: AsRef<str>>(mut self, value: S) -> Self {
        self.config.auth_header = Some(value.as_ref().to_string());
        self
    }

    #[must_use]
    /// Add a cookie (`name=value`) to the opening handshake.
    pub fn add_cookie<S: Into<String>>(mut self, cookie: S) -> Self {
        self.config.cookies.push(cookie.into());
        self
    }

    #[must_use]
    /// Replace the transport used to reach the server.
    pub fn connector<D: Connector>(self, connector: D) -> SessionBuilder<D> {
        SessionBuilder {
            uri: self.uri,
            config: self.config,
            on_message: self.on_message,
            connector,
        }
    }
}

impl<C: Connector> SessionBuilder<C> {
    /// Validate the target and create the session.
    ///
    /// # Errors
    /// Returns `InvalidUri` if the URI is not a usable `ws://` or `wss://` endpoint.
    pub fn build(self) -> Result<Session<C>, ConnectionError> {
        let target = Target::from_uri(&self.uri)?;
        Ok(Session::from_parts(
            target,
            self.config,
            self.on_message,
            self.connector,
        ))
    }
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub(crate) fn generate_key() -> String {
    use rand::RngCore as _;

    let mut key_bytes = [0u8; SEC_WEBSOCKET_KEY_LEN];
    rand::rng().fill_bytes(&mut key_bytes);
    base64.encode(key_bytes)
}

/// The `Sec-WebSocket-Accept` value a server must answer `key` with.
#[must_use]
pub fn accept_key(key: &str) -> String {
    use sha1::{Digest, Sha1};

    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    base64.encode(sha1.finalize())
}

/// Build the opening handshake request for `resource` on `target`.
pub(crate) fn build_request(
    target: &Target,
    resource: &str,
    key: &str,
    config: &SessionConfig,
) -> Result<Request<()>, ConnectionError> {
    let mut req_builder = Request::builder()
        .method("GET")
        .uri(resource)
        .header("Host", target.host_header())
        .header(HEADER_UPGRADE, "websocket")
        .header(HEADER_CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Key", key)
        .header("Sec-WebSocket-Version", WEBSOCKET_VERSION);

    if !config.sub_protocols.is_empty() {
        req_builder = req_builder.header(HEADER_PROTOCOL, config.sub_protocols.join(", "));
    }
    if let Some(origin) = &config.origin {
        req_builder = req_builder.header("Origin", origin);
    }
    if let Some(auth) = &config.auth_header {
        req_builder = req_builder.header("Authorization", auth);
    }
    if !config.cookies.is_empty() {
        req_builder = req_builder.header("Cookie", config.cookies.join("; "));
    }

    req_builder
        .body(())
        .map_err(|_| ConnectionError::BuildHandshakeFailed)
}

/// Check the server's answer to the opening handshake sent with `key`.
///
/// A non-101 status is `HandshakeRejected`. A 101 must then pass, in order: the
/// Upgrade, Connection and Sec-WebSocket-Accept checks, and carry no extension or
/// sub-protocol selection. The first failing check is reported by header name.
pub(crate) fn validate_handshake_response(
    response: Response<()>,
    key: &str,
) -> Result<(), ConnectionError> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ConnectionError::HandshakeRejected(Box::new(response)));
    }

    let upgrade = header_str(&response, HEADER_UPGRADE);
    if !upgrade.is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket")) {
        return Err(ConnectionError::HandshakeValidationFailed(HEADER_UPGRADE));
    }

    let connection = header_str(&response, HEADER_CONNECTION);
    if !connection.is_some_and(|v| {
        v.split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    }) {
        return Err(ConnectionError::HandshakeValidationFailed(
            HEADER_CONNECTION,
        ));
    }

    let accept = header_str(&response, HEADER_ACCEPT);
    let expected = accept_key(key);
    if accept.map(str::trim) != Some(expected.trim()) {
        return Err(ConnectionError::HandshakeValidationFailed(HEADER_ACCEPT));
    }

    if !absent_or_empty(response.headers().get(HEADER_EXTENSIONS)) {
        return Err(ConnectionError::HandshakeValidationFailed(
            HEADER_EXTENSIONS,
        ));
    }

    if !absent_or_empty(response.headers().get(HEADER_PROTOCOL)) {
        return Err(ConnectionError::HandshakeValidationFailed(HEADER_PROTOCOL));
    }

    Ok(())
}

fn header_str<'a>(response: &'a Response<()>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn absent_or_empty(value: Option<&HeaderValue>) -> bool {
    value.is_none_or(|v| v.as_bytes().trim_ascii().is_empty())
}
