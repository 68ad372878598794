// ============================================================================
// REALTIME LISTENER
// ============================================================================
// Push-stream listener feeding the event buffer:
// - Disconnected -> Connecting -> Connected -> Disconnected -> (backoff) ...
// - reconnects unconditionally until cancelled
// - only `events` and `alarm` messages are forwarded
// - transport abstracted behind StreamConnector / MessageStream
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::ConnectionParams;
use crate::error::{CollectorResult, NormalizeError};
use crate::types::BufferedEvent;
use crate::{REALTIME_CONNECT_TIMEOUT_SECS, REALTIME_EVENT_KINDS, REALTIME_RECONNECT_BACKOFF_SECS};

/// Callback receiving every forwarded record.
pub type EventSink = Arc<dyn Fn(BufferedEvent) + Send + Sync>;

// ----------------------------------------------------------------------------
// Transport Seam
// ----------------------------------------------------------------------------

/// An open event stream.
#[async_trait]
pub trait MessageStream: Send {
    /// Next text message, `None` once the peer has closed the stream.
    async fn next_message(&mut self) -> CollectorResult<Option<String>>;

    /// Close the stream from our side.
    async fn close(&mut self);
}

/// Opens event streams.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> CollectorResult<Box<dyn MessageStream>>;
}

// ----------------------------------------------------------------------------
// Listener State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ListenerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ListenerState::Connecting,
            2 => ListenerState::Connected,
            _ => ListenerState::Disconnected,
        }
    }
}

/// Listener state readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn get(&self) -> ListenerState {
        ListenerState::from_u8(self.0.load(AtomicOrdering::Acquire))
    }

    pub fn set(&self, state: ListenerState) {
        self.0.store(state as u8, AtomicOrdering::Release);
    }
}

// ----------------------------------------------------------------------------
// Message Parsing
// ----------------------------------------------------------------------------

/// Records in one stream message whose kind is on the allow-list.
///
/// Messages look like `{"meta": {"message": "events"}, "data": [{..}, ..]}`.
pub fn parse_stream_message(text: &str) -> Result<Vec<BufferedEvent>, NormalizeError> {
    let value: JsonValue = serde_json::from_str(text).map_err(|e| NormalizeError::UnexpectedShape {
        reason: format!("invalid JSON: {}", e),
    })?;

    let kind = value
        .get("meta")
        .and_then(|m| m.get("message"))
        .and_then(|m| m.as_str())
        .ok_or(NormalizeError::MissingField { field: "meta.message" })?;

    if !REALTIME_EVENT_KINDS.contains(&kind) {
        trace!(target: "vigil::realtime", kind = kind, "Ignoring stream message");
        return Ok(Vec::new());
    }

    let data = match value.get("data") {
        Some(JsonValue::Array(items)) => items,
        _ => return Err(NormalizeError::MissingField { field: "data" }),
    };

    Ok(data
        .iter()
        .filter_map(|item| item.as_object())
        .map(|obj| BufferedEvent::new(kind, obj.clone()))
        .collect())
}

// ----------------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------------

enum StreamEnd {
    Cancelled,
    Closed,
    Failed,
}

/// Keeps one stream open and forwards its records to a sink.
pub struct RealtimeListener {
    connector: Arc<dyn StreamConnector>,
    params: ConnectionParams,
    sink: EventSink,
    state: SharedState,
    backoff: Duration,
    connect_timeout: Duration,
}

impl RealtimeListener {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        params: ConnectionParams,
        sink: EventSink,
        state: SharedState,
    ) -> Self {
        Self {
            connector,
            params,
            sink,
            state,
            backoff: Duration::from_secs(REALTIME_RECONNECT_BACKOFF_SECS),
            connect_timeout: Duration::from_secs(REALTIME_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(target: "vigil::realtime", site = %self.params.site, "Realtime listener started");

        while !cancel.is_cancelled() {
            self.state.set(ListenerState::Connecting);

            let attempt = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.params));
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = attempt => result,
            };

            match connected {
                Ok(Ok(mut stream)) => {
                    self.state.set(ListenerState::Connected);
                    info!(target: "vigil::realtime", "Connected to event stream");

                    let end = self.pump(stream.as_mut(), &cancel).await;
                    if matches!(end, StreamEnd::Cancelled) {
                        stream.close().await;
                        self.state.set(ListenerState::Disconnected);
                        break;
                    }
                    self.state.set(ListenerState::Disconnected);
                }
                Ok(Err(e)) => {
                    self.state.set(ListenerState::Disconnected);
                    warn!(target: "vigil::realtime", error = %e, "Event stream connection failed");
                }
                Err(_) => {
                    self.state.set(ListenerState::Disconnected);
                    warn!(target: "vigil::realtime",
                        timeout_ms = self.connect_timeout.as_millis() as u64,
                        "Event stream connection timed out");
                }
            }

            debug!(target: "vigil::realtime",
                backoff_ms = self.backoff.as_millis() as u64,
                "Reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        self.state.set(ListenerState::Disconnected);
        info!(target: "vigil::realtime", "Realtime listener stopped");
    }

    async fn pump(&self, stream: &mut dyn MessageStream, cancel: &CancellationToken) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next_message() => next,
            };

            match next {
                Ok(Some(text)) => self.forward(&text),
                Ok(None) => {
                    info!(target: "vigil::realtime", "Event stream closed by peer");
                    return StreamEnd::Closed;
                }
                Err(e) => {
                    warn!(target: "vigil::realtime", error = %e, "Event stream transport error");
                    return StreamEnd::Failed;
                }
            }
        }
    }

    fn forward(&self, text: &str) {
        match parse_stream_message(text) {
            Ok(events) => {
                for event in events {
                    (self.sink)(event);
                }
            }
            Err(e) => {
                warn!(target: "vigil::realtime", error = %e, "Skipping malformed stream message");
            }
        }
    }
}

impl fmt::Debug for RealtimeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeListener")
            .field("params", &self.params)
            .field("state", &self.state.get())
            .field("backoff", &self.backoff)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// WebSocket Connector
// ----------------------------------------------------------------------------

#[cfg(feature = "websocket")]
pub use self::websocket::WebSocketConnector;

#[cfg(feature = "websocket")]
mod websocket {
    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

    use super::{MessageStream, StreamConnector};
    use crate::client::ConnectionParams;
    use crate::error::{CollectorError, CollectorResult};

    /// Production connector over `tokio-tungstenite`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WebSocketConnector;

    #[async_trait]
    impl StreamConnector for WebSocketConnector {
        async fn connect(&self, params: &ConnectionParams) -> CollectorResult<Box<dyn MessageStream>> {
            let url = params.stream_url()?;
            let fail = |msg: String| CollectorError::connection_failed(url.clone(), msg);

            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| fail(e.to_string()))?;
            if let Some(cookie) = &params.cookie {
                let value = HeaderValue::from_str(cookie).map_err(|e| fail(e.to_string()))?;
                request.headers_mut().insert(COOKIE, value);
            }

            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(!params.verify_tls)
                .danger_accept_invalid_hostnames(!params.verify_tls)
                .build()
                .map_err(|e| fail(e.to_string()))?;

            let (inner, _response) =
                connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls)))
                    .await
                    .map_err(|e| fail(e.to_string()))?;

            Ok(Box::new(WebSocketMessageStream { inner }))
        }
    }

    #[derive(Debug)]
    struct WebSocketMessageStream {
        inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    #[async_trait]
    impl MessageStream for WebSocketMessageStream {
        async fn next_message(&mut self) -> CollectorResult<Option<String>> {
            loop {
                match self.inner.next().await {
                    None | Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            return Ok(Some(text));
                        }
                    }
                    // Ping/pong are answered by the transport.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(CollectorError::connection_failed("event stream", e.to_string()))
                    }
                }
            }
        }

        async fn close(&mut self) {
            let _ = self.inner.close(None).await;
        }
    }
}

// ----------------------------------------------------------------------------
// Scripted transport for tests
// ----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{MessageStream, StreamConnector};
    use crate::client::{ConnectionParams, DeviceType};
    use crate::error::{CollectorError, CollectorResult};

    /// What the next `connect` call does.
    pub enum Script {
        Fail,
        /// Deliver these messages, then stay open until closed
        Open(Vec<String>),
        /// Deliver these messages, then report a peer close
        OpenThenClose(Vec<String>),
        /// Block the calling thread, then open with nothing to deliver
        Stall(Duration),
    }

    #[derive(Default)]
    pub struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        pub attempts: AtomicUsize,
        pub closed: Arc<AtomicBool>,
    }

    impl ScriptedConnector {
        pub fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }
    }

    struct ScriptedStream {
        messages: VecDeque<String>,
        hold_open: bool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MessageStream for ScriptedStream {
        async fn next_message(&mut self) -> CollectorResult<Option<String>> {
            match self.messages.pop_front() {
                Some(m) => Ok(Some(m)),
                None if self.hold_open => futures::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self, _params: &ConnectionParams) -> CollectorResult<Box<dyn MessageStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front().unwrap_or(Script::Open(Vec::new()));
            let (messages, hold_open) = match script {
                Script::Fail => return Err(CollectorError::connection_failed("scripted", "refused")),
                Script::Open(m) => (m, true),
                Script::OpenThenClose(m) => (m, false),
                Script::Stall(pause) => {
                    std::thread::sleep(pause);
                    (Vec::new(), true)
                }
            };
            Ok(Box::new(ScriptedStream {
                messages: messages.into(),
                hold_open,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    pub fn params() -> ConnectionParams {
        ConnectionParams {
            base_url: "https://10.0.0.1".into(),
            site: "default".into(),
            device_type: DeviceType::UnifiOs,
            cookie: None,
            verify_tls: false,
        }
    }

    pub fn events_message(keys: &[&str]) -> String {
        let data: Vec<_> = keys
            .iter()
            .map(|k| serde_json::json!({"key": k, "time": 1_700_000_000_000i64}))
            .collect();
        serde_json::json!({"meta": {"rc": "ok", "message": "events"}, "data": data}).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<BufferedEvent>>>) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&store);
        let sink: EventSink = Arc::new(move |ev| sink_store.lock().push(ev));
        (sink, store)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_parse_filters_kinds() {
        let events = parse_stream_message(&events_message(&["EVT_A", "EVT_B"])).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "events");

        let noise = r#"{"meta":{"message":"sta:sync"},"data":[{"mac":"aa"}]}"#;
        assert!(parse_stream_message(noise).unwrap().is_empty());

        let alarm = r#"{"meta":{"message":"alarm"},"data":[{"key":"EVT_X"}, 42]}"#;
        assert_eq!(parse_stream_message(alarm).unwrap().len(), 1);

        assert!(parse_stream_message("not json").is_err());
        assert!(parse_stream_message(r#"{"data":[]}"#).is_err());
    }

    #[tokio::test]
    async fn test_listener_forwards_and_closes_on_cancel() {
        let connector = ScriptedConnector::new(vec![Script::Open(vec![
            events_message(&["EVT_AP_Lost_Contact"]),
            r#"{"meta":{"message":"device:sync"},"data":[{}]}"#.to_string(),
            "garbage".to_string(),
            events_message(&["EVT_WU_Roam", "EVT_WU_Roam"]),
        ])]);
        let (sink, received) = collecting_sink();
        let state = SharedState::default();
        let cancel = CancellationToken::new();

        let listener = RealtimeListener::new(connector.clone(), params(), sink, state.clone());
        let handle = tokio::spawn(listener.run(cancel.clone()));

        wait_for(|| received.lock().len() == 3).await;
        assert_eq!(state.get(), ListenerState::Connected);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(state.get(), ListenerState::Disconnected);
        assert!(connector.closed.load(Ordering::SeqCst));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_reconnects_after_failures() {
        let connector = ScriptedConnector::new(vec![
            Script::Fail,
            Script::OpenThenClose(vec![events_message(&["EVT_A"])]),
            Script::Open(vec![events_message(&["EVT_B"])]),
        ]);
        let (sink, received) = collecting_sink();
        let state = SharedState::default();
        let cancel = CancellationToken::new();

        let listener = RealtimeListener::new(connector.clone(), params(), sink, state.clone())
            .with_backoff(Duration::from_millis(5));
        let handle = tokio::spawn(listener.run(cancel.clone()));

        wait_for(|| received.lock().len() == 2).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(state.get(), ListenerState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let connector = ScriptedConnector::new(vec![Script::Fail]);
        let (sink, _received) = collecting_sink();
        let cancel = CancellationToken::new();

        let listener = RealtimeListener::new(connector.clone(), params(), sink, SharedState::default())
            .with_backoff(Duration::from_secs(3600));
        let handle = tokio::spawn(listener.run(cancel.clone()));

        wait_for(|| connector.attempts.load(Ordering::SeqCst) == 1).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
