use std::{sync::Arc, time::Duration};

use http::Uri;
use log::{debug, info, warn};
use nazar_proto::msg::StreamQuery;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    frame::{FrameError, decode_frame},
    transport::{StreamError, Transport, TransportEvent},
    view::ViewModel,
};

/// Fixed wait between losing the connection and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// One subscription, cycling `Connecting -> Connected -> Disconnected` until
/// it is closed.
pub struct Session {
    filter: Option<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Session {
    fn open(
        transport: Arc<dyn Transport>,
        url: Uri,
        filter: Option<String>,
        view: Arc<watch::Sender<ViewModel>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let driver = Driver {
            transport,
            url,
            filter: filter.clone(),
            view,
            cancel: cancel.clone(),
        };

        Self {
            filter,
            cancel,
            task: Some(tokio::spawn(driver.run())),
        }
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Stop the session. Once this returns the session no longer touches the
    /// view and its connection has been released.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("session task failed: {e}");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    transport: Arc<dyn Transport>,
    url: Uri,
    filter: Option<String>,
    view: Arc<watch::Sender<ViewModel>>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self) {
        loop {
            debug!("connecting to {}", self.url);
            let mut events = self.transport.open(&self.url);

            let err = loop {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(TransportEvent::Open) => {
                            info!("connected to {}", self.url);
                            self.view.send_modify(ViewModel::set_connected);
                        }
                        Some(TransportEvent::Message(data)) => self.on_frame(&data),
                        Some(TransportEvent::Error(e)) => break e,
                        None => break StreamError::Closed,
                    },
                }
            };
            drop(events);

            warn!("connection lost: {err}");
            self.view.send_modify(ViewModel::set_disconnected);

            info!("reconnecting in {} ms...", RECONNECT_DELAY.as_millis());
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    fn on_frame(&self, data: &str) {
        match decode_frame(data, self.filter.as_deref()) {
            Ok(record) => self.view.send_modify(|view| view.records.push(record)),
            Err(e @ FrameError::OtherHost(_)) => debug!("dropping frame: {e}"),
            Err(e) => warn!("dropping frame: {e}"),
        }
    }
}

/// Owns the active subscription and the view it feeds.
pub struct StreamClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    view: Arc<watch::Sender<ViewModel>>,
    session: Option<Session>,
}

impl StreamClient {
    pub fn new(transport: impl Transport, base_url: impl Into<String>) -> Self {
        Self {
            transport: Arc::new(transport),
            base_url: base_url.into(),
            view: Arc::new(watch::Sender::new(ViewModel::default())),
            session: None,
        }
    }

    /// The view stays observable across re-subscriptions.
    pub fn subscribe(&self) -> watch::Receiver<ViewModel> {
        self.view.subscribe()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Subscribe to the feed, optionally for a single host. An empty host
    /// means all hosts.
    ///
    /// Any active session is closed first and the view starts empty; records
    /// from the previous subscription are discarded.
    pub async fn open(&mut self, filter: Option<String>) -> Result<(), StreamError> {
        let filter = filter.filter(|host| !host.is_empty());
        let query = StreamQuery {
            host: filter.clone(),
        };
        let url: Uri = query.url(&self.base_url).parse()?;

        self.close().await;
        self.view.send_replace(ViewModel::default());

        info!("subscribing to {url}");
        self.session = Some(Session::open(
            self.transport.clone(),
            url,
            filter,
            self.view.clone(),
        ));
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("closing session");
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nazar_proto::MetricRecord;
    use tokio::{
        sync::mpsc,
        time::{Instant, advance},
    };

    use super::*;
    use crate::{
        buffer::BUFFER_CAPACITY,
        transport::fake::FakeTransport,
        view::CONNECTION_LOST,
    };

    const BASE_URL: &str = "http://feed.test:8000";

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn frame(host: &str, timestamp: &str) -> TransportEvent {
        TransportEvent::Message(format!(r#"{{"timestamp":"{timestamp}","host":"{host}"}}"#))
    }

    async fn connected_client() -> (StreamClient, FakeTransport, watch::Receiver<ViewModel>) {
        let transport = FakeTransport::default();
        let mut client = StreamClient::new(transport.clone(), BASE_URL);
        let view = client.subscribe();
        client.open(None).await.unwrap();
        settle().await;
        transport.last().emit(TransportEvent::Open).await;
        settle().await;
        (client, transport, view)
    }

    #[tokio::test(start_paused = true)]
    async fn starts_connecting_then_connects() {
        let transport = FakeTransport::default();
        let mut client = StreamClient::new(transport.clone(), BASE_URL);
        let view = client.subscribe();

        client.open(None).await.unwrap();
        settle().await;

        assert_eq!(transport.connections().len(), 1);
        assert_eq!(transport.last().url, "http://feed.test:8000/stream");
        assert!(!view.borrow().connected);
        assert_eq!(view.borrow().error, None);

        transport.last().emit(TransportEvent::Open).await;
        settle().await;

        assert!(view.borrow().connected);
        assert_eq!(view.borrow().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_prepended() {
        let (_client, transport, view) = connected_client().await;
        let conn = transport.last();

        conn.emit(frame("A", "t1")).await;
        conn.emit(frame("B", "t1")).await;
        conn.emit(frame("A", "t2")).await;
        settle().await;

        let view = view.borrow();
        assert_eq!(view.records.iter().next(), Some(&MetricRecord::new("A", "t2")));
        assert_eq!(
            view.hosts(),
            [&MetricRecord::new("A", "t2"), &MetricRecord::new("B", "t1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_is_capped() {
        let (_client, transport, view) = connected_client().await;
        let conn = transport.last();

        for i in 1..=BUFFER_CAPACITY + 1 {
            conn.emit(frame("A", &format!("t{i}"))).await;
        }
        settle().await;

        let view = view.borrow();
        assert_eq!(view.records.len(), BUFFER_CAPACITY);
        assert_eq!(view.records.iter().next().unwrap().timestamp, "t51");
        assert_eq!(view.records.iter().last().unwrap().timestamp, "t2");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_dropped() {
        let (_client, transport, view) = connected_client().await;
        let conn = transport.last();
        conn.emit(frame("A", "t1")).await;
        settle().await;
        let before = view.borrow().clone();

        conn.emit(TransportEvent::Message("{not json".into())).await;
        conn.emit(TransportEvent::Message(r#"{"timestamp":"t","host":""}"#.into()))
            .await;
        settle().await;

        assert_eq!(*view.borrow(), before);
        assert!(view.borrow().connected);
        assert!(!conn.is_released());
        assert_eq!(transport.connections().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_fixed_delay() {
        let (_client, transport, view) = connected_client().await;
        transport.last().emit(frame("A", "t1")).await;
        settle().await;

        let lost_at = Instant::now();
        transport
            .last()
            .emit(TransportEvent::Error(StreamError::Closed))
            .await;
        settle().await;

        assert!(!view.borrow().connected);
        assert_eq!(view.borrow().error.as_deref(), Some(CONNECTION_LOST));
        assert_eq!(view.borrow().records.len(), 1, "stale data stays visible");
        assert!(transport.connections()[0].is_released());

        advance(RECONNECT_DELAY - Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(transport.connections().len(), 1);

        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(transport.connections().len(), 2);
        assert_eq!(transport.last().opened_at - lost_at, RECONNECT_DELAY);

        // error stays until the new connection opens
        assert_eq!(view.borrow().error.as_deref(), Some(CONNECTION_LOST));
        transport.last().emit(TransportEvent::Open).await;
        settle().await;
        assert!(view.borrow().connected);
        assert_eq!(view.borrow().error, None);
        assert_eq!(view.borrow().records.len(), 1, "reconnect keeps the buffer");
    }

    /// Hangs up every connection as soon as it is opened.
    #[derive(Clone, Default)]
    struct HangUpTransport(Arc<AtomicUsize>);

    impl Transport for HangUpTransport {
        fn open(&self, _url: &Uri) -> mpsc::Receiver<TransportEvent> {
            self.0.fetch_add(1, Ordering::SeqCst);
            mpsc::channel(1).1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_counts_as_transport_failure() {
        let transport = HangUpTransport::default();
        let mut client = StreamClient::new(transport.clone(), BASE_URL);
        let view = client.subscribe();

        client.open(None).await.unwrap();
        settle().await;

        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert!(!view.borrow().connected);
        assert_eq!(view.borrow().error.as_deref(), Some(CONNECTION_LOST));

        advance(RECONNECT_DELAY).await;
        settle().await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_reconnect_delay() {
        let (mut client, transport, view) = connected_client().await;
        transport
            .last()
            .emit(TransportEvent::Error(StreamError::Closed))
            .await;
        settle().await;
        let before = view.borrow().clone();

        advance(Duration::from_millis(1000)).await;
        client.close().await;
        advance(RECONNECT_DELAY * 3).await;
        settle().await;

        assert_eq!(transport.connections().len(), 1);
        assert_eq!(*view.borrow(), before);
        assert!(client.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_connection() {
        let (mut client, transport, view) = connected_client().await;
        let conn = transport.last();

        client.close().await;

        assert!(conn.is_released());
        assert!(conn.events.send(frame("A", "t1")).await.is_err());
        assert!(view.borrow().records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_session_cancels_it() {
        let (client, transport, _view) = connected_client().await;
        let conn = transport.last();

        drop(client);
        settle().await;

        assert!(conn.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_replaces_session_and_buffer() {
        let (mut client, transport, view) = connected_client().await;
        let first = transport.last();
        first.emit(frame("web-1", "t1")).await;
        settle().await;
        assert_eq!(view.borrow().records.len(), 1);

        client.open(Some("web-1".into())).await.unwrap();
        settle().await;

        assert!(first.is_released());
        assert_eq!(transport.connections().len(), 2);
        assert_eq!(
            transport.last().url,
            "http://feed.test:8000/stream?host=web-1"
        );
        assert_eq!(client.session().and_then(Session::filter), Some("web-1"));
        assert_eq!(*view.borrow(), ViewModel::default());
    }

    #[tokio::test(start_paused = true)]
    async fn host_filter_isolation() {
        let transport = FakeTransport::default();
        let mut client = StreamClient::new(transport.clone(), BASE_URL);
        let view = client.subscribe();
        client.open(Some("web-1".into())).await.unwrap();
        settle().await;

        let conn = transport.last();
        conn.emit(TransportEvent::Open).await;
        for (host, ts) in [("web-1", "t1"), ("web-2", "t1"), ("Web-1", "t2"), ("web-1", "t3")] {
            conn.emit(frame(host, ts)).await;
        }
        settle().await;

        let view = view.borrow();
        assert_eq!(view.records.len(), 2);
        assert!(view.records.iter().all(|r| r.host == "web-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_host_means_all_hosts() {
        let transport = FakeTransport::default();
        let mut client = StreamClient::new(transport.clone(), BASE_URL);
        let view = client.subscribe();
        client.open(Some(String::new())).await.unwrap();
        settle().await;

        let conn = transport.last();
        assert_eq!(conn.url, "http://feed.test:8000/stream");
        assert_eq!(client.session().and_then(Session::filter), None);

        conn.emit(TransportEvent::Open).await;
        conn.emit(frame("web-1", "t1")).await;
        conn.emit(frame("db-1", "t1")).await;
        settle().await;

        assert_eq!(view.borrow().records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_base_url_is_rejected() {
        let (_client, transport, _view) = connected_client().await;
        let mut broken = StreamClient::new(transport.clone(), "http://bad host");

        assert!(matches!(broken.open(None).await, Err(StreamError::Url(_))));
        assert!(broken.session().is_none());
        assert_eq!(transport.connections().len(), 1);
    }
}
