//! WebSocket client link with automatic reconnection.
//!
//! Used by the remote REPL and by worker daemons. A supervisor task owns the
//! socket; callers queue text frames through [`ReconnectingConnection::send`]
//! and observe the link through a channel of [`ConnectionEvent`]s.

use crate::error::ConnectionError;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// A text frame from the server.
    Message(String),
    Disconnected,
    /// About to make reconnection attempt `n` (1-based).
    Reconnecting(u32),
    /// Attempts are exhausted or the server refused us; the link is dead.
    ReconnectFailed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting(u32),
    Failed,
    Closed,
}

/// How to reach the server and how hard to try.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub token: Option<String>,
    pub reconnect: bool,
    pub interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ConnectionConfig {
    /// Interactive clients give up after ten tries, three seconds apart.
    pub fn client(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            reconnect: true,
            interval: Duration::from_secs(3),
            max_attempts: Some(10),
        }
    }

    /// Workers keep trying every five seconds until stopped.
    pub fn worker(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            reconnect: true,
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    url: Url,
    /// The URL without credentials, for logs and errors.
    display: String,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: Notify,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Move to `state` unless the caller already closed the link.
    fn transition(&self, state: ConnectionState) -> bool {
        let mut current = self.state.lock();
        if *current == ConnectionState::Closed {
            return false;
        }
        *current = state;
        true
    }

    /// Mark the link up with a fresh outbound queue.
    fn attach(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return None;
            }
            *state = ConnectionState::Connected;
            *self.outbound.lock() = Some(tx);
        }
        self.emit(ConnectionEvent::Connected);
        Some(rx)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn is_closed(&self) -> bool {
        *self.state.lock() == ConnectionState::Closed
    }
}

/// A client link that re-dials the server after unexpected closes.
pub struct ReconnectingConnection {
    shared: Arc<Shared>,
}

impl ReconnectingConnection {
    /// Create an idle connection and the receiver for its events.
    pub fn new(
        config: ConnectionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), ConnectionError> {
        let url = build_url(&config.url, config.token.as_deref())?;
        let mut display = url.clone();
        display.set_query(None);

        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            url,
            display: display.to_string(),
            state: Mutex::new(ConnectionState::Idle),
            outbound: Mutex::new(None),
            events,
            closed: Notify::new(),
        });
        Ok((Self { shared }, rx))
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Server URL without the token.
    pub fn url(&self) -> &str {
        &self.shared.display
    }

    /// Open the link.
    ///
    /// Returns once the handshake is done and [`send`](Self::send) works. A
    /// failed first handshake is returned here and does not start the
    /// reconnect loop; the connection is then `Failed` for good. Once open,
    /// later drops are retried in the background.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Idle => *state = ConnectionState::Connecting,
                ConnectionState::Failed | ConnectionState::Closed => return Err(ConnectionError::Closed),
                _ => return Ok(()),
            }
        }

        let ws = match dial(&self.shared.url, &self.shared.display).await {
            Ok(ws) => ws,
            Err(e) => {
                self.shared.transition(ConnectionState::Failed);
                return Err(e);
            }
        };

        let outbound = self.shared.attach().ok_or(ConnectionError::Closed)?;
        info!(url = %self.shared.display, "connected");
        tokio::spawn(supervise(self.shared.clone(), ws, outbound));
        Ok(())
    }

    /// Queue a text frame. Fails unless the link is up.
    pub fn send(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            _ => return Err(ConnectionError::NotConnected),
        }
        let outbound = self.shared.outbound.lock();
        let tx = outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        tx.send(Message::Text(text.into().into()))
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Close the link for good. No reconnection follows.
    pub fn disconnect(&self) {
        self.shared.set_state(ConnectionState::Closed);
        // Dropping the sender makes the driver send a close frame.
        self.shared.outbound.lock().take();
        self.shared.closed.notify_waiters();
    }
}

impl Drop for ReconnectingConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Owns the socket for the lifetime of the link, re-dialing as configured.
async fn supervise(shared: Arc<Shared>, mut ws: WsStream, mut outbound: mpsc::UnboundedReceiver<Message>) {
    loop {
        drive(ws, outbound, &shared).await;
        shared.outbound.lock().take();

        if shared.is_closed() {
            debug!(url = %shared.display, "connection closed by caller");
            return;
        }
        shared.emit(ConnectionEvent::Disconnected);
        warn!(url = %shared.display, "connection lost");

        if !shared.config.reconnect {
            shared.transition(ConnectionState::Failed);
            return;
        }

        ws = match redial(&shared).await {
            Some(ws) => ws,
            None => return,
        };
        outbound = match shared.attach() {
            Some(rx) => rx,
            None => return,
        };
    }
}

/// Retry until a handshake succeeds, attempts run out, or the caller closes.
async fn redial(shared: &Shared) -> Option<WsStream> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if shared.config.max_attempts.is_some_and(|max| attempt > max) {
            warn!(url = %shared.display, "giving up after {} attempts", attempt - 1);
            shared.transition(ConnectionState::Failed);
            shared.emit(ConnectionEvent::ReconnectFailed);
            return None;
        }

        if !shared.transition(ConnectionState::Reconnecting(attempt)) {
            return None;
        }
        shared.emit(ConnectionEvent::Reconnecting(attempt));

        tokio::select! {
            _ = tokio::time::sleep(shared.config.interval) => {}
            _ = shared.closed.notified() => return None,
        }
        if !shared.transition(ConnectionState::Connecting) {
            return None;
        }

        match dial(&shared.url, &shared.display).await {
            Ok(ws) => {
                info!(url = %shared.display, attempt, "reconnected");
                return Some(ws);
            }
            Err(e @ ConnectionError::Unauthorized { .. }) => {
                shared.emit(ConnectionEvent::Error(e.to_string()));
                shared.transition(ConnectionState::Failed);
                shared.emit(ConnectionEvent::ReconnectFailed);
                return None;
            }
            Err(e) => debug!(error = %e, attempt, "reconnect attempt failed"),
        }
    }
}

/// Pump frames both ways until either side goes away.
async fn drive(ws: WsStream, mut outbound: mpsc::UnboundedReceiver<Message>, shared: &Shared) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        shared.emit(ConnectionEvent::Error(e.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    shared.emit(ConnectionEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if !shared.is_closed() {
                        shared.emit(ConnectionEvent::Error(e.to_string()));
                    }
                    break;
                }
            },
        }
    }
}

async fn dial(url: &Url, display: &str) -> Result<WsStream, ConnectionError> {
    match connect_async(url.as_str()).await {
        Ok((ws, _)) => Ok(ws),
        Err(tungstenite::Error::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
            Err(ConnectionError::Unauthorized {
                url: display.to_string(),
            })
        }
        Err(e) => Err(ConnectionError::Unreachable {
            url: display.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Normalize a server address into a `ws://` or `wss://` URL carrying the
/// token as a query parameter.
pub fn build_url(raw: &str, token: Option<&str>) -> Result<Url, ConnectionError> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{}", raw)
    };
    let mut url =
        Url::parse(&with_scheme).map_err(|e| ConnectionError::InvalidUrl(format!("{}: {}", raw, e)))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ConnectionError::InvalidUrl(format!(
                "{}: unsupported scheme {}",
                raw, other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(raw.to_string()))?;

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn fast(url: String, max: u32) -> ConnectionConfig {
        ConnectionConfig {
            url,
            token: Some("t0k".into()),
            reconnect: true,
            interval: Duration::from_millis(20),
            max_attempts: Some(max),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_build_url() {
        let url = build_url("localhost:3000", Some("abc")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3000/?token=abc");

        let url = build_url("https://example.com/ws", None).unwrap();
        assert_eq!(url.as_str(), "wss://example.com/ws");

        assert!(matches!(
            build_url("ftp://example.com", None),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_send_requires_connection() {
        let (conn, _rx) = ReconnectingConnection::new(fast("ws://127.0.0.1:1".into(), 1)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(matches!(conn.send("hi"), Err(ConnectionError::NotConnected)));
        conn.disconnect();
        assert!(matches!(conn.send("hi"), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_first_failure_is_returned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (conn, _rx) = ReconnectingConnection::new(fast(format!("ws://{}", addr), 3)).unwrap();
        assert!(matches!(
            conn.connect().await,
            Err(ConnectionError::Unreachable { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Failed);
        // Failed is terminal.
        assert!(matches!(conn.connect().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_send_right_after_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(format!("got:{}", text.as_str()).into()))
                    .await
                    .unwrap();
            }
            let _ = ws.next().await;
        });

        let (conn, mut rx) = ReconnectingConnection::new(fast(format!("ws://{}", addr), 1)).unwrap();
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.send("hi").unwrap();

        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::Message("got:hi".into())
        );
    }

    #[tokio::test]
    async fn test_disconnect_stops_reconnection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let (conn, mut rx) = ReconnectingConnection::new(fast(format!("ws://{}", addr), 5)).unwrap();
        conn.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);

        conn.disconnect();
        // Ten reconnect intervals pass without any further link activity.
        let quiet = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match rx.recv().await {
                    Some(ConnectionEvent::Error(_)) => {}
                    other => return other,
                }
            }
        })
        .await;
        assert!(quiet.is_err(), "unexpected event after disconnect: {:?}", quiet);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.connect().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_unauthorized_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let reject = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
                let mut response = ErrorResponse::new(None);
                *response.status_mut() = StatusCode::UNAUTHORIZED;
                Err(response)
            };
            let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
        });

        let (conn, _rx) = ReconnectingConnection::new(fast(format!("ws://{}", addr), 3)).unwrap();
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unauthorized { .. }));
        assert!(!err.to_string().contains("t0k"));
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("hello".to_string().into())).await.unwrap();
            // Echo one frame back.
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(format!("echo:{}", text.as_str()).into()))
                    .await
                    .unwrap();
            }
            let _ = ws.next().await;
        });

        let (conn, mut rx) = ReconnectingConnection::new(fast(format!("ws://{}", addr), 1)).unwrap();
        conn.connect().await.unwrap();
        assert_eq!(next_event(&mut rx).await, ConnectionEvent::Connected);
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::Message("hello".into())
        );
        conn.send("ping").unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::Message("echo:ping".into())
        );
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Drop the connection and stop listening.
            let _ = ws.close(None).await;
            drop(listener);
        });

        let (conn, mut rx) = ReconnectingConnection::new(fast(format!("ws://{}", addr), 3)).unwrap();
        conn.connect().await.unwrap();

        let mut events = Vec::new();
        loop {
            let event = next_event(&mut rx).await;
            let last = event == ConnectionEvent::ReconnectFailed;
            events.push(event);
            if last {
                break;
            }
        }
        let events: Vec<ConnectionEvent> = events
            .into_iter()
            .filter(|e| !matches!(e, ConnectionEvent::Error(_)))
            .collect();
        assert_eq!(
            events,
            vec![
                ConnectionEvent::Connected,
                ConnectionEvent::Disconnected,
                ConnectionEvent::Reconnecting(1),
                ConnectionEvent::Reconnecting(2),
                ConnectionEvent::Reconnecting(3),
                ConnectionEvent::ReconnectFailed,
            ]
        );
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection is dropped at once, the second one stays up.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("again".to_string().into())).await.unwrap();
            let _ = ws.next().await;
        });

        let (conn, mut rx) = ReconnectingConnection::new(fast(format!("ws://{}", addr), 5)).unwrap();
        conn.connect().await.unwrap();

        let mut saw_reconnect = false;
        loop {
            match next_event(&mut rx).await {
                ConnectionEvent::Reconnecting(_) => saw_reconnect = true,
                ConnectionEvent::Message(text) => {
                    assert_eq!(text, "again");
                    break;
                }
                ConnectionEvent::ReconnectFailed => panic!("should have reconnected"),
                _ => {}
            }
        }
        assert!(saw_reconnect);
        assert!(conn.is_connected());
    }
}
