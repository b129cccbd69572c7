//! The byte stream a session runs over, and the one HTTP/1.1 exchange it needs.

use std::future::Future;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::bytes::BytesMut;

use crate::connection::client::Target;
use crate::errors::ConnectionError;

const MAX_RESPONSE_HEAD: usize = 8192;
const MAX_RESPONSE_HEADERS: usize = 64;

// Trait alias for the boxed stream type owned by a Session
pub trait WebSocketStream: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> WebSocketStream for T {}

pub type BoxedStream = Box<dyn WebSocketStream + Send>;

/// Opens the byte stream for a [`Target`].
///
/// The default [`TcpConnector`] dials TCP and wraps `wss` targets in TLS. Other
/// implementations can hand the session any ordered, reliable byte stream.
pub trait Connector {
    /// Establish a stream to `target`. Failures are returned as is; the session does not retry.
    fn connect(
        &self,
        target: &Target,
    ) -> impl Future<Output = Result<BoxedStream, ConnectionError>> + Send;
}

/// TCP connector, with rustls for `wss://` targets.
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls_config: Option<Arc<ClientConfig>>,
}

impl TcpConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` for `wss://` targets instead of the bundled webpki roots.
    #[must_use]
    pub fn with_tls_config(config: Arc<ClientConfig>) -> Self {
        Self {
            tls_config: Some(config),
        }
    }

    fn tls_config(&self) -> Arc<ClientConfig> {
        if let Some(config) = &self.tls_config {
            return Arc::clone(config);
        }
        let root_store = webpki_roots::TLS_SERVER_ROOTS
            .iter()
            .cloned()
            .collect::<RootCertStore>();
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    }
}

impl Connector for TcpConnector {
    async fn connect(&self, target: &Target) -> Result<BoxedStream, ConnectionError> {
        let host = target.host().trim_start_matches('[').trim_end_matches(']');
        tracing::debug!(host, port = target.port(), secure = target.is_secure(), "connecting");

        let tcp_stream = tokio::net::TcpStream::connect((host, target.port()))
            .await
            .map_err(ConnectionError::ConnectFailed)?;
        if !target.is_secure() {
            return Ok(Box::new(tcp_stream));
        }

        let connector = TlsConnector::from(self.tls_config());
        let server_name =
            ServerName::try_from(host.to_owned()).map_err(|_| ConnectionError::InvalidDnsName)?;
        let stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(ConnectionError::TlsHandshakeFailed)?;
        Ok(Box::new(stream))
    }
}

/// Write `request` to `stream` and read back the response head.
///
/// Returns the parsed response and whatever bytes the peer sent after the head; those
/// already belong to the framed protocol.
pub(crate) async fn send_request<S>(
    stream: &mut S,
    request: &Request<()>,
) -> Result<(Response<()>, BytesMut), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&encode_request(request))
        .await
        .map_err(ConnectionError::WriteHandshakeFailed)?;
    stream
        .flush()
        .await
        .map_err(ConnectionError::WriteHandshakeFailed)?;
    read_response(stream).await
}

fn encode_request(req: &Request<()>) -> Vec<u8> {
    let target = req
        .uri()
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(req.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in req.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

async fn read_response<S>(stream: &mut S) -> Result<(Response<()>, BytesMut), ConnectionError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(ConnectionError::ReadHandshakeFailed)?;
        if n == 0 {
            return Err(ConnectionError::ReadHandshakeFailed(
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }

        if let Some((response, head_len)) = parse_response(&buf)? {
            let rest = buf.split_off(head_len);
            return Ok((response, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(ConnectionError::HandshakeResponseTooLarge);
        }
    }
}

fn parse_response(buf: &[u8]) -> Result<Option<(Response<()>, usize)>, ConnectionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let head_len = match res
        .parse(buf)
        .map_err(|_| ConnectionError::ParseHandshakeFailed)?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let code = res.code.ok_or(ConnectionError::ParseHandshakeFailed)?;
    let status =
        StatusCode::from_u16(code).map_err(|_| ConnectionError::MalformedHandshakeResponse)?;
    let mut builder = Response::builder().status(status);
    for h in res.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    let response = builder
        .body(())
        .map_err(|_| ConnectionError::MalformedHandshakeResponse)?;
    Ok(Some((response, head_len)))
}
