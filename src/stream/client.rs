//! Reconnecting SSE client with pause/resume delivery.
//!
//! The client owns the transport lifecycle: it fetches a stream token, opens
//! the event-source request, filters frames against the accepted event types,
//! and recovers from failures after a fixed delay. All connect and disconnect
//! work runs through a [`ConnectionQueue`] so transports never race.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::{LoginState, TokenClient};
use crate::queue::ConnectionQueue;
use crate::stream::event::{EventTypes, StreamEvent};
use crate::stream::wire::{SseDecoder, SseFrame, DEFAULT_EVENT_TYPE};

/// Delay before a reconnect attempt after a transient failure.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Bound on the transport open phase, request sent to response headers.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUS_CAPACITY: usize = 1024;

/// Connection lifecycle published on the status channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// No subscribe has armed the client yet.
    Idle,
    /// A connect operation is queued or running.
    Connecting,
    /// Transport is open and delivering events.
    Open,
    /// Transport or token failure with a reconnect scheduled.
    Error,
    /// Not signed in, or the token endpoint rejected the session; nothing
    /// further happens until a fresh sign-in and subscribe.
    NeedsAuth,
    /// Torn down by [`SseClient::close`].
    Closed,
}

/// Tunables for [`SseClient::with_options`].
#[derive(Clone, Debug)]
pub struct SseClientOptions {
    /// Accepted event-name allowlist.
    pub event_types: EventTypes,
    /// Delay before reconnect attempts.
    pub reconnect_delay: Duration,
    /// Bound on waiting for the stream response headers. The streamed body
    /// is never bounded.
    pub open_timeout: Duration,
    /// Lane serializing connection operations. `None` selects the
    /// process-wide queue.
    pub queue: Option<ConnectionQueue>,
}

impl Default for SseClientOptions {
    fn default() -> Self {
        Self {
            event_types: EventTypes::opened_only(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            queue: None,
        }
    }
}

/// Reconnecting event-source client.
///
/// Clones share one logical connection: every [`SseClient::subscribe`] call
/// observes the same event stream, and the transport is armed once for all
/// of them.
#[derive(Clone)]
pub struct SseClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    stream_url: String,
    http: Client,
    tokens: TokenClient,
    login: Arc<dyn LoginState>,
    event_types: EventTypes,
    reconnect_delay: Duration,
    open_timeout: Duration,
    queue: ConnectionQueue,
    bus: broadcast::Sender<StreamEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    opened: bool,
    paused: bool,
    buffer: VecDeque<StreamEvent>,
    token: Option<SecretString>,
    transport: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl SseClient {
    /// Creates a client accepting only the `opened` sentinel.
    pub fn new(
        stream_url: impl Into<String>,
        tokens: TokenClient,
        login: Arc<dyn LoginState>,
    ) -> Self {
        Self::with_options(stream_url, tokens, login, SseClientOptions::default())
    }

    /// Creates a client with an explicit vocabulary and tuning.
    pub fn with_options(
        stream_url: impl Into<String>,
        tokens: TokenClient,
        login: Arc<dyn LoginState>,
        options: SseClientOptions,
    ) -> Self {
        let stream_url = stream_url.into().trim_end().to_string();
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (status_tx, _) = watch::channel(ConnectionStatus::Idle);
        let queue = options.queue.unwrap_or_else(ConnectionQueue::global);
        // The transport reuses the token client's pool; a stream body must
        // not sit under a global request timeout.
        let http = tokens.http().clone();

        Self {
            inner: Arc::new(ClientInner {
                stream_url,
                http,
                tokens,
                login,
                event_types: options.event_types,
                reconnect_delay: options.reconnect_delay,
                open_timeout: options.open_timeout,
                queue,
                bus,
                status_tx,
                state: Mutex::new(ConnState::default()),
            }),
        }
    }

    /// Registers an observer and arms the connection on first use.
    ///
    /// The first subscribe since construction or since the last
    /// [`SseClient::close`] queues a connect operation; later calls only
    /// attach to the bus. Dropping the returned [`Subscription`] detaches the
    /// observer without touching the connection.
    pub fn subscribe(&self) -> Subscription {
        let rx = self.inner.bus.subscribe();

        let arm = {
            let mut st = self.inner.state();
            if st.opened {
                false
            } else {
                st.opened = true;
                true
            }
        };

        if arm {
            self.inner.set_status(ConnectionStatus::Connecting);
            debug!(event = "stream_connect_queued");
            let inner = Arc::clone(&self.inner);
            self.inner.queue.push(async move {
                run_connect(inner).await;
            });
        }

        Subscription { rx }
    }

    /// Cancels any pending reconnect and queues transport teardown.
    ///
    /// Safe to call when not connected. Pause state and buffered events are
    /// left untouched; a later [`SseClient::subscribe`] arms the connection
    /// again.
    pub fn close(&self) {
        {
            let mut st = self.inner.state();
            if let Some(timer) = st.reconnect.take() {
                timer.abort();
            }
            st.opened = false;
        }
        self.inner.set_status(ConnectionStatus::Closed);
        debug!(event = "stream_close_requested");

        let inner = Arc::clone(&self.inner);
        self.inner.queue.push(async move {
            teardown_transport(&inner);
        });
    }

    /// Pauses or resumes delivery.
    ///
    /// While paused, incoming events accumulate in arrival order instead of
    /// reaching subscribers. Resuming flushes the buffer front to back before
    /// any later event is delivered.
    pub fn wait(&self, paused: bool) {
        let mut st = self.inner.state();
        st.paused = paused;
        if paused {
            return;
        }
        while let Some(event) = st.buffer.pop_front() {
            let _ = self.inner.bus.send(event);
        }
    }

    /// Returns a receiver observing connection lifecycle changes.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Reads the current lifecycle state.
    pub fn current_status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }
}

impl ClientInner {
    /// State is only ever touched inside short sections that never await.
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }
}

/// Queued connect operation: login check, token fetch, transport open.
///
/// Settles on every path so the queue always advances. Failures never reach
/// subscribers; they either schedule a delayed reconnect or, for 401/504 and
/// signed-out states, stop silently.
async fn run_connect(inner: Arc<ClientInner>) {
    if !inner.login.is_logged_in() {
        debug!(event = "stream_connect_skipped", reason = "not_logged_in");
        inner.set_status(ConnectionStatus::NeedsAuth);
        return;
    }

    inner.set_status(ConnectionStatus::Connecting);

    match inner.tokens.fetch().await {
        Ok(token) => {
            inner.state().token = Some(token.clone());
            match open_transport(&inner, &token).await {
                Ok(()) => {
                    inner.set_status(ConnectionStatus::Open);
                    debug!(event = "stream_transport_open");
                }
                Err(err) => {
                    warn!(event = "stream_transport_open_failed", error = %err);
                    inner.set_status(ConnectionStatus::Error);
                    schedule_reconnect(&inner);
                }
            }
        }
        Err(err) if err.is_terminal() => {
            warn!(event = "stream_token_rejected", error = %err);
            inner.set_status(ConnectionStatus::NeedsAuth);
        }
        Err(err) => {
            warn!(event = "stream_token_fetch_failed", error = %err);
            inner.set_status(ConnectionStatus::Error);
            schedule_reconnect(&inner);
        }
    }
}

/// Failure opening the event-source request.
#[derive(Debug, Error)]
enum TransportOpenError {
    #[error("stream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no response headers within {0:?}")]
    TimedOut(Duration),
}

/// Opens the event-source request and spawns the reader task.
///
/// Only the header phase is bounded by the open timeout; the streamed body
/// stays open indefinitely. Replaces any live transport, so at most one
/// reader exists per client even when a stale queued connect lands after a
/// close/resubscribe.
async fn open_transport(
    inner: &Arc<ClientInner>,
    token: &SecretString,
) -> Result<(), TransportOpenError> {
    let url = format!("{}?token={}", inner.stream_url, token.expose_secret());
    let request = inner.http.get(&url).header(ACCEPT, "text/event-stream");
    let response = match tokio::time::timeout(inner.open_timeout, request.send()).await {
        Ok(sent) => sent?.error_for_status()?,
        Err(_) => return Err(TransportOpenError::TimedOut(inner.open_timeout)),
    };

    let reader_inner = Arc::clone(inner);
    let reader = tokio::spawn(async move {
        read_stream(reader_inner, response).await;
    });

    let mut st = inner.state();
    if let Some(previous) = st.transport.replace(reader) {
        previous.abort();
    }
    Ok(())
}

/// Reader task: decodes frames off the response body and routes them.
///
/// Stream errors and server end-of-stream both feed the reconnect path; a
/// teardown aborts this task instead, so deliberate closes schedule nothing.
async fn read_stream(inner: Arc<ClientInner>, response: reqwest::Response) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for frame in decoder.feed(&bytes) {
                    deliver_frame(&inner, frame);
                }
            }
            Err(err) => {
                warn!(event = "stream_read_failed", error = %err);
                handle_transport_error(&inner);
                return;
            }
        }
    }

    debug!(event = "stream_ended_by_server");
    handle_transport_error(&inner);
}

/// Routes one decoded frame: allowlist filter, payload decode, pause check.
fn deliver_frame(inner: &Arc<ClientInner>, frame: SseFrame) {
    let event_type = frame.event.as_deref().unwrap_or(DEFAULT_EVENT_TYPE);
    if !inner.event_types.accepts(event_type) {
        return;
    }

    let event = StreamEvent::new(event_type, &frame.data);

    let mut st = inner.state();
    if st.paused {
        st.buffer.push_back(event);
        return;
    }
    // A send error only means no subscriber is currently attached.
    let _ = inner.bus.send(event);
}

/// Transport drop recovery: queued teardown plus a delayed reconnect.
fn handle_transport_error(inner: &Arc<ClientInner>) {
    let still_open = inner.state().opened;

    let teardown_inner = Arc::clone(inner);
    inner.queue.push(async move {
        teardown_transport(&teardown_inner);
    });

    // A close that already landed wins: it cleared `opened`, and no new
    // reconnect may be armed past it.
    if still_open {
        inner.set_status(ConnectionStatus::Error);
        schedule_reconnect(inner);
    }
}

/// Closes the live transport and drops the held token.
///
/// Runs as a queued operation. Pause state and buffered events survive. On a
/// client that is no longer opened the status settles back at closed,
/// overriding whatever a stale connect published after [`SseClient::close`].
fn teardown_transport(inner: &Arc<ClientInner>) {
    let mut st = inner.state();
    let transport = st.transport.take();
    let had_token = st.token.take().is_some();
    let closed = !st.opened;
    drop(st);

    let had_transport = transport.is_some();
    if let Some(reader) = transport {
        reader.abort();
    }
    if closed {
        inner.set_status(ConnectionStatus::Closed);
    }
    debug!(event = "stream_transport_teardown", had_transport, had_token);
}

/// Arms the reconnect timer, replacing any pending one.
///
/// The fired timer queues a full connect operation; [`SseClient::close`]
/// aborts the timer before it fires. A client that is no longer opened never
/// arms a timer, and a timer that fires into one pushes nothing: once
/// closed, only a fresh subscribe may connect again.
fn schedule_reconnect(inner: &Arc<ClientInner>) {
    let delay = inner.reconnect_delay;
    let timer_inner = Arc::clone(inner);
    let timer = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        {
            let mut st = timer_inner.state();
            st.reconnect = None;
            // A close that lands between the sleep and this point must not
            // be followed by a queued connect.
            if !st.opened {
                return;
            }
        }
        debug!(
            event = "stream_reconnect_due",
            delay_ms = delay.as_millis() as u64
        );
        let connect_inner = Arc::clone(&timer_inner);
        timer_inner.queue.push(async move {
            run_connect(connect_inner).await;
        });
    });

    let mut st = inner.state();
    if !st.opened {
        timer.abort();
        return;
    }
    if let Some(previous) = st.reconnect.replace(timer) {
        previous.abort();
    }
}

/// Handle observing delivered events.
///
/// Dropping the subscription detaches the observer;
/// [`Subscription::unsubscribe`] spells the same thing out.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<StreamEvent>,
}

impl Subscription {
    /// Receives the next event, or `None` once the client is gone.
    ///
    /// A subscriber that falls behind the bus capacity skips the overwritten
    /// events and resumes from the oldest retained one.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "stream_subscriber_lagged", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive attempt.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(event = "stream_subscriber_lagged", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Detaches the observer.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::{deliver_frame, ConnectionStatus, SseClient, SseClientOptions, Subscription};
    use crate::auth::TokenClient;
    use crate::queue::ConnectionQueue;
    use crate::stream::event::{EventData, EventTypes};
    use crate::stream::wire::SseFrame;

    fn test_client(event_types: EventTypes) -> SseClient {
        let tokens = TokenClient::new("http://localhost:0").expect("token client");
        SseClient::with_options(
            "http://localhost:0/events",
            tokens,
            Arc::new(|| true),
            SseClientOptions {
                event_types,
                reconnect_delay: Duration::from_millis(50),
                queue: Some(ConnectionQueue::new()),
                ..SseClientOptions::default()
            },
        )
    }

    /// Attaches to the bus without arming a connect.
    fn bus_subscription(client: &SseClient) -> Subscription {
        Subscription {
            rx: client.inner.bus.subscribe(),
        }
    }

    fn frame(event: Option<&str>, data: &str) -> SseFrame {
        SseFrame {
            event: event.map(str::to_string),
            data: data.to_string(),
        }
    }

    #[test]
    fn frames_outside_the_allowlist_are_dropped() {
        let client = test_client(EventTypes::new(["ticker"]));
        let mut sub = bus_subscription(&client);

        deliver_frame(&client.inner, frame(Some("other"), "x"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn accepted_frames_reach_the_bus_with_decoded_payload() {
        let client = test_client(EventTypes::new(["ticker"]));
        let mut sub = bus_subscription(&client);

        deliver_frame(&client.inner, frame(Some("ticker"), r#"{"price":1}"#));
        let event = sub.try_recv().expect("delivered event");
        assert_eq!(event.event_type, "ticker");
        assert!(matches!(event.data, EventData::Json(_)));
    }

    #[test]
    fn unnamed_frames_default_to_the_message_type() {
        let client = test_client(EventTypes::new(["message"]));
        let mut sub = bus_subscription(&client);

        deliver_frame(&client.inner, frame(None, "hello"));
        let event = sub.try_recv().expect("delivered event");
        assert_eq!(event.event_type, "message");
        assert_eq!(event.data.as_text(), Some("hello"));
    }

    #[test]
    fn paused_delivery_buffers_in_arrival_order_and_flushes_fifo() {
        let client = test_client(EventTypes::new(["msg"]));
        let mut sub = bus_subscription(&client);

        client.wait(true);
        deliver_frame(&client.inner, frame(Some("msg"), "a"));
        deliver_frame(&client.inner, frame(Some("msg"), "b"));
        assert!(sub.try_recv().is_none());

        client.wait(false);
        assert_eq!(
            sub.try_recv().expect("first flushed").data.as_text(),
            Some("a")
        );
        assert_eq!(
            sub.try_recv().expect("second flushed").data.as_text(),
            Some("b")
        );
        assert!(sub.try_recv().is_none());
        assert!(client.inner.state().buffer.is_empty());
    }

    #[test]
    fn status_starts_idle() {
        let client = test_client(EventTypes::opened_only());
        assert_eq!(client.current_status(), ConnectionStatus::Idle);
    }

    #[test]
    fn stream_url_is_trimmed() {
        let client = {
            let tokens = TokenClient::new("http://localhost:0").expect("token client");
            SseClient::new("http://localhost:0/events  \n", tokens, Arc::new(|| true))
        };
        assert_eq!(client.inner.stream_url, "http://localhost:0/events");
    }

    #[test]
    fn close_clears_opened_and_keeps_the_paused_buffer() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let client = test_client(EventTypes::new(["msg"]));
            client.wait(true);
            deliver_frame(&client.inner, frame(Some("msg"), "kept"));

            let mut status = client.status();
            client.close();

            timeout(
                Duration::from_secs(1),
                status.wait_for(|s| *s == ConnectionStatus::Closed),
            )
            .await
            .expect("status should settle")
            .expect("status channel open");
            assert!(!client.inner.state().opened);
            assert_eq!(client.inner.state().buffer.len(), 1);
        });
    }
}
