use bytes::BytesMut;
use http::{StatusCode, Uri, header};
use log::{debug, trace};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    http_util::{self, BodyDecoder},
    sse::SseDecoder,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One thing that happened on the push connection.
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    /// Payload of one `message` event.
    Message(String),
    /// The connection is gone. Nothing follows this event.
    Error(StreamError),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("URL error: {0}")]
    Url(#[from] http::uri::InvalidUri),
    #[error("connection failed: {0:#}")]
    Connect(anyhow::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: unexpected status {0}")]
    Status(StatusCode),
    #[error("HTTP error: unexpected content type {0:?}")]
    ContentType(String),
    #[error("HTTP error: {0}")]
    Protocol(String),
    #[error("stream closed by server")]
    Closed,
}

/// Something that can open a push connection to the feed.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `url`.
    ///
    /// Events arrive on the returned channel; a closed channel counts as a
    /// transport close. Dropping the receiver releases the connection.
    fn open(&self, url: &Uri) -> mpsc::Receiver<TransportEvent>;
}

/// Server-sent events over HTTP/1.1, with or without TLS.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    prefer_ipv6: bool,
}

impl HttpTransport {
    pub fn new(prefer_ipv6: bool) -> Self {
        Self { prefer_ipv6 }
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &Uri) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let url = url.clone();
        let prefer_ipv6 = self.prefer_ipv6;

        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("releasing feed connection to {url}");
                }
                res = pump(&url, prefer_ipv6, &tx) => {
                    if let Err(e) = res {
                        let _ = tx.send(TransportEvent::Error(e)).await;
                    }
                }
            }
        });

        rx
    }
}

/// Drive one connection until it fails. `Ok` means the receiver went away.
async fn pump(
    url: &Uri,
    prefer_ipv6: bool,
    tx: &mpsc::Sender<TransportEvent>,
) -> Result<(), StreamError> {
    let mut stream = http_util::connect(url, prefer_ipv6)
        .await
        .map_err(StreamError::Connect)?;
    let req = http_util::event_stream_request(url).map_err(StreamError::Connect)?;
    stream
        .write_all(&http_util::assemble_http_request(&req))
        .await?;
    stream.flush().await?;

    let mut buffer = BytesMut::with_capacity(4096);
    let head = http_util::read_response_head(&mut stream, &mut buffer).await?;
    trace!("response head: {head:?}");

    if !head.status().is_success() {
        return Err(StreamError::Status(head.status()));
    }
    let content_type = head
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !is_event_stream(content_type) {
        return Err(StreamError::ContentType(content_type.to_owned()));
    }

    let mut body = BodyDecoder::for_headers(head.headers());
    let mut decoder = SseDecoder::new();
    let mut payload = BytesMut::new();

    if tx.send(TransportEvent::Open).await.is_err() {
        return Ok(());
    }

    loop {
        let finished = body.decode(&mut buffer, &mut payload)?;
        let events = decoder
            .feed(&payload.split())
            .map_err(|e| StreamError::Protocol(e.to_string()))?;
        for event in events {
            if !event.is_message() {
                debug!("ignoring {:?} event", event.event);
                continue;
            }
            trace!("message event, id {:?}", event.id);
            if tx.send(TransportEvent::Message(event.data)).await.is_err() {
                return Ok(());
            }
        }

        if finished || stream.read_buf(&mut buffer).await? == 0 {
            return Err(StreamError::Closed);
        }
    }
}

fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
}
