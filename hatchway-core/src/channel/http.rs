//! The HTTP request channel: emits one HTTP/1.x request over a new or
//! pooled TCP/UNIX/TLS connection and streams the response back. The
//! first payload frame towards the browser is a JSON object with the
//! status line and headers; everything after is raw body bytes.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use hatchway_common::{ChannelId, Problem};
use hatchway_tls::{configure_client_tls, ClientTlsOptions};
use rustls_pki_types::ServerName;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::channel::{
    io_problem, ChannelEvent, ChannelEventTx, ChannelHandle, ChannelOp, OpenOptions,
};

const MAX_RESPONSE_HEADERS: usize = 64;

pub struct HttpChannel;

impl HttpChannel {
    pub fn open(
        id: ChannelId,
        options: OpenOptions,
        events_tx: ChannelEventTx,
        pool: HttpPool,
    ) -> ChannelHandle {
        let (ops_tx, ops_rx) = unbounded_channel();
        tokio::spawn(run(id, options, ops_rx, events_tx, pool));
        ChannelHandle { ops_tx }
    }
}

/* ---------------------------------------------------------------------
 * Connections and the keep-alive pool
 */

pub(crate) enum HttpStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    UnixTls(Box<tokio_rustls::client::TlsStream<UnixStream>>),
}

impl AsyncRead for HttpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            HttpStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::UnixTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            HttpStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::UnixTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            HttpStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Unix(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_flush(cx),
            HttpStream::UnixTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            HttpStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::UnixTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Tcp { host: String, port: u16 },
    Unix(String),
}

/// Live connections that survived keep-alive, waiting for the next
/// channel with a matching `connection` name. Entries are taken
/// exclusively and only returned after a clean completion.
#[derive(Clone, Default)]
pub struct HttpPool {
    inner: Arc<Mutex<HashMap<String, PooledConnection>>>,
}

struct PooledConnection {
    target: Target,
    tls: bool,
    stream: HttpStream,
}

impl HttpPool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn take(&self, name: &str, target: &Target, tls: bool) -> Option<HttpStream> {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .get(name)
            .is_some_and(|entry| entry.target == *target && entry.tls == tls);
        if matches {
            inner.remove(name).map(|entry| entry.stream)
        } else {
            None
        }
    }

    async fn put(&self, name: String, target: Target, tls: bool, stream: HttpStream) {
        self.inner
            .lock()
            .await
            .insert(name, PooledConnection { target, tls, stream });
    }
}

/* ---------------------------------------------------------------------
 * Request options
 */

#[derive(Debug)]
struct RequestOptions {
    target: Target,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    tls: Option<ClientTlsOptions>,
    connection: Option<String>,
    host_header: String,
}

async fn load_pem(value: &Value) -> Result<Vec<u8>, Problem> {
    let Some(obj) = value.as_object() else {
        return Err(Problem::ProtocolError);
    };
    if let Some(data) = obj.get("data").and_then(Value::as_str) {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(file) = obj.get("file").and_then(Value::as_str) {
        return tokio::fs::read(file).await.map_err(|e| io_problem(&e));
    }
    Err(Problem::ProtocolError)
}

async fn parse_request_options(options: &OpenOptions) -> Result<RequestOptions, Problem> {
    let target = match (options.int("port"), options.str("unix")) {
        (Some(port), None) if (1..=65535).contains(&port) => Target::Tcp {
            host: options.str("address").unwrap_or("localhost").to_owned(),
            port: port as u16,
        },
        (None, Some(path)) => Target::Unix(path.to_owned()),
        _ => {
            warn!("http channel needs either a port or a unix option");
            return Err(Problem::ProtocolError);
        }
    };

    let Some(method) = options.str("method").filter(|m| !m.is_empty()) else {
        warn!("http channel is missing a method option");
        return Err(Problem::ProtocolError);
    };
    let Some(path) = options.str("path").filter(|p| !p.is_empty()) else {
        warn!("http channel is missing a path option");
        return Err(Problem::ProtocolError);
    };

    let mut headers = Vec::new();
    if let Some(map) = options.object("headers") {
        for (name, value) in map {
            let Some(value) = value.as_str() else {
                warn!(header = %name, "http channel header is not a string");
                return Err(Problem::ProtocolError);
            };
            headers.push((name.clone(), value.to_owned()));
        }
    }

    let tls = match options.object("tls") {
        None => None,
        Some(obj) => {
            let mut opts = ClientTlsOptions::new();
            if let Some(validate) = obj.get("validate").and_then(Value::as_bool) {
                opts.validate = validate;
            }
            if let Some(authority) = obj.get("authority") {
                opts.authority = Some(load_pem(authority).await?);
            }
            if let (Some(cert), Some(key)) = (obj.get("certificate"), obj.get("key")) {
                opts.identity = Some((load_pem(cert).await?, load_pem(key).await?));
            }
            Some(opts)
        }
    };

    let host_header = match &target {
        Target::Tcp { host, port } => format!("{host}:{port}"),
        Target::Unix(_) => "localhost".to_owned(),
    };

    Ok(RequestOptions {
        target,
        method: method.to_owned(),
        path: path.to_owned(),
        headers,
        tls,
        connection: options.str("connection").map(str::to_owned),
        host_header,
    })
}

/* ---------------------------------------------------------------------
 * Keep-alive
 */

/// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close; a `Connection`
/// header overrides either way.
pub fn parse_keep_alive(version_minor: u8, connection: Option<&str>) -> bool {
    match connection.map(str::to_ascii_lowercase) {
        Some(c) if c.contains("close") => false,
        Some(c) if c.contains("keep-alive") => true,
        _ => version_minor == 1,
    }
}

/* ---------------------------------------------------------------------
 * Chunked transfer decoding
 */

#[derive(Debug, Default)]
enum ChunkState {
    #[default]
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder. Tolerates chunk
/// extensions, trailing headers and input split at any byte boundary.
#[derive(Debug, Default)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode whatever is decodable, moving data bytes into `out`.
    /// Returns true once the terminating chunk and trailers are consumed.
    pub fn feed(&mut self, input: &mut BytesMut, out: &mut Vec<Bytes>) -> Result<bool, ()> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(nl) = input.iter().position(|b| *b == b'\n') else {
                        return Ok(false);
                    };
                    let line = input.split_to(nl + 1);
                    let line = std::str::from_utf8(&line[..nl]).map_err(|_| ())?;
                    let line = line.trim_end_matches('\r');
                    // Everything after ';' is a chunk extension.
                    let size_part = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_part, 16).map_err(|_| ())?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(input.len() as u64) as usize;
                    out.push(input.split_to(take).freeze());
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd => {
                    // The CRLF after chunk data; may arrive byte by byte.
                    let Some(nl) = input.iter().position(|b| *b == b'\n') else {
                        if input.iter().any(|b| *b != b'\r') {
                            return Err(());
                        }
                        return Ok(false);
                    };
                    if input[..nl].iter().any(|b| *b != b'\r') {
                        return Err(());
                    }
                    let _ = input.split_to(nl + 1);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(nl) = input.iter().position(|b| *b == b'\n') else {
                        return Ok(false);
                    };
                    let line = input.split_to(nl + 1);
                    let empty = line[..nl].iter().all(|b| *b == b'\r');
                    if empty {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

enum BodyDecoder {
    Chunked(ChunkedDecoder),
    Length(u64),
    UntilClose,
}

impl BodyDecoder {
    fn feed(&mut self, input: &mut BytesMut, out: &mut Vec<Bytes>) -> Result<bool, Problem> {
        match self {
            BodyDecoder::Chunked(decoder) => {
                decoder.feed(input, out).map_err(|_| Problem::ProtocolError)
            }
            BodyDecoder::Length(remaining) => {
                if !input.is_empty() {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    out.push(input.split_to(take).freeze());
                    *remaining -= take as u64;
                }
                Ok(*remaining == 0)
            }
            BodyDecoder::UntilClose => {
                if !input.is_empty() {
                    out.push(input.split().freeze());
                }
                Ok(false)
            }
        }
    }
}

/* ---------------------------------------------------------------------
 * The channel itself
 */

enum HttpFailure {
    Problem(Problem),
    /// The browser closed the channel mid-flight.
    Aborted(Option<Problem>),
}

impl From<Problem> for HttpFailure {
    fn from(value: Problem) -> Self {
        HttpFailure::Problem(value)
    }
}

async fn run(
    id: ChannelId,
    options: OpenOptions,
    mut ops_rx: UnboundedReceiver<ChannelOp>,
    events_tx: ChannelEventTx,
    pool: HttpPool,
) {
    let request = match parse_request_options(&options).await {
        Ok(request) => request,
        Err(problem) => {
            let _ = events_tx.send((id, ChannelEvent::closed(Some(problem))));
            return;
        }
    };

    let _ = events_tx.send((id, ChannelEvent::Ready));

    // The request body is everything the browser sends before `done`.
    let mut body = BytesMut::new();
    loop {
        match ops_rx.recv().await {
            Some(ChannelOp::Recv(data)) => body.extend_from_slice(&data),
            Some(ChannelOp::Done) => break,
            Some(ChannelOp::Close(problem)) => {
                let _ = events_tx.send((id, ChannelEvent::closed(problem)));
                return;
            }
            None => return,
        }
    }

    let result = perform(id, &request, body.freeze(), &mut ops_rx, &events_tx, &pool).await;
    let problem = match result {
        Ok(()) => {
            // The response is complete; nothing further follows.
            let _ = events_tx.send((id, ChannelEvent::Done));
            None
        }
        Err(HttpFailure::Problem(problem)) => Some(problem),
        Err(HttpFailure::Aborted(problem)) => problem,
    };
    let _ = events_tx.send((id, ChannelEvent::closed(problem)));
}

/// TLS-wrap an established connection, whatever its carrier.
async fn wrap_tls<S>(
    tls: &ClientTlsOptions,
    host: &str,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>, Problem>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let config = configure_client_tls(tls).map_err(|error| {
        warn!(%error, "couldn't set up TLS");
        Problem::InternalError
    })?;
    let server_name =
        ServerName::try_from(host.to_owned()).map_err(|_| Problem::ProtocolError)?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    match connector.connect(server_name, stream).await {
        Ok(tls_stream) => Ok(tls_stream),
        Err(error) => {
            let certificate_rejected = error
                .get_ref()
                .and_then(|e| e.downcast_ref::<rustls::Error>())
                .is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_)));
            warn!(%error, "TLS handshake failed");
            if certificate_rejected {
                // The same token SSH uses, so the browser handles both
                // trust failures uniformly.
                Err(Problem::UnknownHostkey)
            } else {
                Err(Problem::InternalError)
            }
        }
    }
}

async fn connect(request: &RequestOptions) -> Result<HttpStream, Problem> {
    match &request.target {
        Target::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| io_problem(&e))?;
            match &request.tls {
                None => Ok(HttpStream::Unix(stream)),
                Some(tls) => Ok(HttpStream::UnixTls(Box::new(
                    wrap_tls(tls, "localhost", stream).await?,
                ))),
            }
        }
        Target::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|e| io_problem(&e))?;
            match &request.tls {
                None => Ok(HttpStream::Tcp(stream)),
                Some(tls) => Ok(HttpStream::Tls(Box::new(
                    wrap_tls(tls, host, stream).await?,
                ))),
            }
        }
    }
}

fn build_request_head(request: &RequestOptions, body_len: usize) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, request.path);

    let mut saw_host = false;
    for (name, value) in &request.headers {
        match name.to_ascii_lowercase().as_str() {
            // The channel owns framing and connection management.
            "content-length" | "transfer-encoding" | "connection" => continue,
            "host" => saw_host = true,
            _ => {}
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    if !saw_host {
        head.push_str("Host: ");
        head.push_str(&request.host_header);
        head.push_str("\r\n");
    }
    if body_len > 0 {
        head.push_str(&format!("Content-Length: {body_len}\r\n"));
    }
    if request.connection.is_none() {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

struct ResponseHead {
    status: u16,
    reason: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The metadata object the browser sees as the channel's first
    /// payload frame. Framing headers are not forwarded.
    fn to_meta(&self) -> Value {
        let mut headers = Map::new();
        for (name, value) in &self.headers {
            match name.to_ascii_lowercase().as_str() {
                "transfer-encoding" | "content-length" | "connection" | "keep-alive" => continue,
                _ => {
                    headers.insert(name.clone(), Value::from(value.clone()));
                }
            }
        }
        let mut meta = Map::new();
        meta.insert("status".into(), Value::from(self.status));
        meta.insert("reason".into(), Value::from(self.reason.clone()));
        meta.insert("headers".into(), Value::Object(headers));
        Value::Object(meta)
    }
}

fn try_parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, Problem> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let head = ResponseHead {
                status: response.code.ok_or(Problem::ProtocolError)?,
                reason: response.reason.unwrap_or("").to_owned(),
                version_minor: response.version.ok_or(Problem::ProtocolError)?,
                headers: response
                    .headers
                    .iter()
                    .map(|h| {
                        Ok((
                            h.name.to_owned(),
                            std::str::from_utf8(h.value)
                                .map_err(|_| Problem::ProtocolError)?
                                .to_owned(),
                        ))
                    })
                    .collect::<Result<Vec<_>, Problem>>()?,
            };
            Ok(Some((head, consumed)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(error) => {
            warn!(%error, "received a malformed HTTP response");
            Err(Problem::ProtocolError)
        }
    }
}

async fn perform(
    id: ChannelId,
    request: &RequestOptions,
    body: Bytes,
    ops_rx: &mut UnboundedReceiver<ChannelOp>,
    events_tx: &ChannelEventTx,
    pool: &HttpPool,
) -> Result<(), HttpFailure> {
    let tls = request.tls.is_some();

    let mut stream = match &request.connection {
        Some(name) => match pool.take(name, &request.target, tls).await {
            Some(stream) => {
                debug!(channel = id, connection = %name, "reusing pooled connection");
                stream
            }
            None => connect(request).await?,
        },
        None => connect(request).await?,
    };

    let head = build_request_head(request, body.len());
    stream
        .write_all(&head)
        .await
        .map_err(|_| Problem::InternalError)?;
    if !body.is_empty() {
        stream
            .write_all(&body)
            .await
            .map_err(|_| Problem::InternalError)?;
    }
    stream.flush().await.map_err(|_| Problem::InternalError)?;

    // Response head; may arrive in arbitrarily small pieces.
    let mut buf = BytesMut::with_capacity(8192);
    let head = loop {
        if let Some((head, consumed)) = try_parse_head(&buf)? {
            let _ = buf.split_to(consumed);
            break head;
        }
        tokio::select! {
            op = ops_rx.recv() => match op {
                Some(ChannelOp::Close(problem)) => return Err(HttpFailure::Aborted(problem)),
                Some(_) => {}
                None => return Err(HttpFailure::Aborted(None)),
            },
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        warn!(channel = id, "server closed the connection before responding");
                        return Err(Problem::ProtocolError.into());
                    }
                    Ok(_) => {}
                    Err(_) => return Err(Problem::InternalError.into()),
                }
            }
        }
    };

    let _ = events_tx.send((
        id,
        ChannelEvent::Data(Bytes::from(head.to_meta().to_string().into_bytes())),
    ));

    // Prefer chunked, then Content-Length, else read until close.
    let mut decoder = if head
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        BodyDecoder::Chunked(ChunkedDecoder::new())
    } else if let Some(length) = head.header("content-length") {
        let length = length
            .trim()
            .parse::<u64>()
            .map_err(|_| Problem::ProtocolError)?;
        BodyDecoder::Length(length)
    } else {
        BodyDecoder::UntilClose
    };
    let until_close = matches!(decoder, BodyDecoder::UntilClose);

    let mut emit = |pieces: &mut Vec<Bytes>| {
        for piece in pieces.drain(..) {
            if !piece.is_empty() {
                let _ = events_tx.send((id, ChannelEvent::Data(piece)));
            }
        }
    };

    let mut pieces = Vec::new();
    let mut done = decoder.feed(&mut buf, &mut pieces)?;
    emit(&mut pieces);

    while !done {
        tokio::select! {
            op = ops_rx.recv() => match op {
                Some(ChannelOp::Close(problem)) => return Err(HttpFailure::Aborted(problem)),
                Some(_) => {}
                None => return Err(HttpFailure::Aborted(None)),
            },
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        if until_close {
                            done = true;
                        } else {
                            warn!(channel = id, "truncated HTTP response body");
                            return Err(Problem::ProtocolError.into());
                        }
                    }
                    Ok(_) => {
                        done = decoder.feed(&mut buf, &mut pieces)?;
                        emit(&mut pieces);
                    }
                    Err(_) => return Err(Problem::InternalError.into()),
                }
            }
        }
    }

    let keep_alive =
        parse_keep_alive(head.version_minor, head.header("connection")) && !until_close;
    if keep_alive {
        if let Some(name) = &request.connection {
            pool.put(name.clone(), request.target.clone(), tls, stream)
                .await;
        }
    }

    Ok(())
}
