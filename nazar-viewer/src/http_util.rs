use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, Request, Response, Uri, header, response};
use itertools::Itertools;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{TcpStream, lookup_host},
    task::JoinSet,
};
use tokio_native_tls::{TlsConnector as TokioTlsConnector, native_tls::TlsConnector};

use crate::transport::StreamError;

const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(150);
const MAX_HEADERS: usize = 64;
const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Plain TCP or TLS, decided by the URI scheme.
pub type FeedStream = Box<dyn AsyncReadWrite>;

/// `GET` request for a long-lived `text/event-stream` response.
pub fn event_stream_request(uri: &Uri) -> anyhow::Result<Request<Bytes>> {
    let authority = uri
        .authority()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?
        .as_str();
    let host = authority
        .find('@')
        .map(|idx| authority.split_at(idx + 1).1)
        .unwrap_or(authority);

    if host.is_empty() {
        anyhow::bail!("URL error: empty host name");
    }

    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::HOST, host)
        .header(header::ACCEPT, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCEPT_ENCODING, "identity")
        .body(Bytes::new())?;

    Ok(req)
}

pub fn is_tls(uri: &Uri) -> anyhow::Result<bool> {
    match uri.scheme_str() {
        Some("http") => Ok(false),
        Some("https") => Ok(true),
        other => anyhow::bail!("URL error: unsupported scheme {other:?}"),
    }
}

pub async fn connect(uri: &Uri, prefer_ipv6: bool) -> anyhow::Result<FeedStream> {
    let tls = is_tls(uri)?;
    let domain = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?;
    // bracketed IPv6 literal
    let domain = domain
        .strip_prefix('[')
        .and_then(|d| d.strip_suffix(']'))
        .unwrap_or(domain);
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    trace!("connecting to ({domain}, {port})");

    let stream = connect_happy_eyeballs(domain, port, prefer_ipv6).await?;

    let stream: FeedStream = if tls {
        let connector = TokioTlsConnector::from(TlsConnector::new()?);
        Box::new(connector.connect(domain, stream).await?)
    } else {
        Box::new(stream)
    };

    Ok(stream)
}

/// Race connection attempts over every resolved address, alternating address
/// families and starting a new attempt every `HAPPY_EYEBALLS_DELAY`.
async fn connect_happy_eyeballs(
    domain: &str,
    port: u16,
    prefer_ipv6: bool,
) -> anyhow::Result<TcpStream> {
    let (v4, v6): (Vec<_>, Vec<_>) = lookup_host((domain, port))
        .await?
        .partition(|a| a.is_ipv4());
    let (first, second) = if prefer_ipv6 { (v6, v4) } else { (v4, v6) };
    let mut pending = first.into_iter().interleave(second);

    let mut attempts = JoinSet::new();
    loop {
        if let Some(addr) = pending.next() {
            attempts.spawn(TcpStream::connect(addr));
        }
        if attempts.is_empty() {
            anyhow::bail!("I/O error: all connection attempts to {domain}:{port} failed");
        }

        let res = tokio::select! {
            res = attempts.join_next() => res,
            _ = tokio::time::sleep(HAPPY_EYEBALLS_DELAY) => continue,
        };
        match res {
            Some(Ok(Ok(stream))) => {
                debug!(
                    "connection established with {}",
                    stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or("<unknown>".to_string())
                );
                return Ok(stream);
            }
            Some(Ok(Err(e))) => trace!("connection attempt failed: {e}"),
            Some(Err(e)) => trace!("connection attempt panicked: {e}"),
            None => {}
        }
    }
}

pub fn assemble_http_request<T: AsRef<[u8]>>(req: &Request<T>) -> Bytes {
    let mut buffer = BytesMut::with_capacity(256);

    buffer.put_slice(
        format!(
            "{} {} {:?}\r\n",
            req.method(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
            req.version()
        )
        .as_bytes(),
    );

    for (name, value) in req.headers() {
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }
    buffer.put_slice(b"\r\n");
    buffer.put_slice(req.body().as_ref());

    trace!("Request: {:?}", String::from_utf8_lossy(&buffer));

    buffer.freeze()
}

/// Read until a full response head is buffered. Body bytes that arrived with
/// the head stay in `buffer`.
pub async fn read_response_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffer: &mut BytesMut,
) -> Result<Response<()>, StreamError> {
    loop {
        if let Some((resp, head_len)) = parse_response_head(buffer)? {
            buffer.advance(head_len);
            return Ok(resp);
        }
        if buffer.len() > MAX_HEAD_SIZE {
            return Err(StreamError::Protocol("response head too large".into()));
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(StreamError::Closed);
        }
    }
}

fn parse_response_head(bytes: &[u8]) -> Result<Option<(Response<()>, usize)>, StreamError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let httparse::Status::Complete(head_len) = resp
        .parse(bytes)
        .map_err(|e| StreamError::Protocol(e.to_string()))?
    else {
        return Ok(None);
    };

    let mut builder = response::Builder::new()
        .status(resp.code.unwrap_or(200))
        .version(match resp.version.unwrap_or(1) {
            0 => http::Version::HTTP_10,
            _ => http::Version::HTTP_11,
        });
    for header in resp.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let resp = builder
        .body(())
        .map_err(|e| StreamError::Protocol(e.to_string()))?;

    Ok(Some((resp, head_len)))
}

/// Payload framing of a response body.
#[derive(Debug)]
pub enum BodyDecoder {
    /// Everything until EOF is payload.
    Identity,
    Chunked(ChunkedDecoder),
}

impl BodyDecoder {
    pub fn for_headers(headers: &HeaderMap) -> Self {
        let chunked = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));

        if chunked {
            BodyDecoder::Chunked(ChunkedDecoder::default())
        } else {
            BodyDecoder::Identity
        }
    }

    /// Move payload bytes from `buf` into `out`. Returns `true` once the body
    /// has provably ended.
    pub fn decode(&mut self, buf: &mut BytesMut, out: &mut BytesMut) -> Result<bool, StreamError> {
        match self {
            BodyDecoder::Identity => {
                out.unsplit(buf.split());
                Ok(false)
            }
            BodyDecoder::Chunked(decoder) => decoder.decode(buf, out),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    #[default]
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

impl ChunkedDecoder {
    pub fn decode(&mut self, buf: &mut BytesMut, out: &mut BytesMut) -> Result<bool, StreamError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    // chunk extensions follow a ';'
                    let size = line[..].split(|b| *b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(size)
                        .ok()
                        .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                        .ok_or_else(|| {
                            StreamError::Protocol(format!(
                                "invalid chunk size {:?}",
                                String::from_utf8_lossy(&line)
                            ))
                        })?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let n = remaining.min(buf.len() as u64);
                    out.unsplit(buf.split_to(n as usize));
                    self.state = if n == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - n)
                    };
                }
                ChunkState::DataEnd => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    if !line.is_empty() {
                        return Err(StreamError::Protocol("missing CRLF after chunk".into()));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, StreamError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos);
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => {
            Err(StreamError::Protocol("chunk framing line too long".into()))
        }
        None => Ok(None),
    }
}
