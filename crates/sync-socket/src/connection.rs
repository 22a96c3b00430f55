//! WebSocket transport for the push channel.
//!
//! One spawned task per open attempt. The task connects, runs the keepalive,
//! parses inbound text frames and reports everything back as
//! [`ConnectionEvent`]s tagged with the attempt's generation. It never touches
//! session state; deciding whether to reconnect is the runtime's job.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sync_core::{
    FrameError, InboundFrame, MessageEvent, NORMAL_CLOSE_CODE, SyncError, SyncErrorCategory,
    keepalive_frame, parse_frame,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, timeout},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed for one open attempt.
#[derive(Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub token: String,
    pub keepalive_interval: Duration,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.url.as_str())
            .field("keepalive_interval", &self.keepalive_interval)
            .finish_non_exhaustive()
    }
}

/// What the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(MessageEvent),
    Malformed(FrameError),
    /// Connection ended, or the connect attempt failed.
    Closed {
        normal: bool,
        code: Option<u16>,
        reason: String,
    },
}

/// A transport event tagged with the open attempt it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Owner side of a running transport task.
#[derive(Debug)]
pub struct ConnectionHandle {
    generation: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Close with code 1000 and wait for the task to finish.
    pub async fn close(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the transport task for one open attempt.
pub fn spawn_connection<T>(
    request: ConnectRequest,
    generation: u64,
    events: mpsc::UnboundedSender<T>,
) -> ConnectionHandle
where
    T: From<ConnectionEvent> + Send + 'static,
{
    let stop = CancellationToken::new();
    let stop_child = stop.child_token();
    let task = tokio::spawn(async move {
        let reporter = Reporter { generation, events };
        run_connection(request, stop_child, &reporter).await;
    });

    ConnectionHandle {
        generation,
        stop,
        task,
    }
}

struct Reporter<T> {
    generation: u64,
    events: mpsc::UnboundedSender<T>,
}

impl<T: From<ConnectionEvent>> Reporter<T> {
    fn report(&self, event: TransportEvent) {
        let _ = self.events.send(T::from(ConnectionEvent {
            generation: self.generation,
            event,
        }));
    }

    fn closed(&self, normal: bool, code: Option<u16>, reason: impl Into<String>) {
        self.report(TransportEvent::Closed {
            normal,
            code,
            reason: reason.into(),
        });
    }
}

async fn run_connection<T: From<ConnectionEvent>>(
    request: ConnectRequest,
    stop: CancellationToken,
    reporter: &Reporter<T>,
) {
    let generation = reporter.generation;
    let upgrade = match build_upgrade_request(&request) {
        Ok(upgrade) => upgrade,
        Err(err) => {
            warn!(generation, error = %err, "cannot build push connection request");
            reporter.closed(false, None, err.message);
            return;
        }
    };

    debug!(generation, url = %request.url, "opening push connection");
    let connected = tokio::select! {
        _ = stop.cancelled() => {
            reporter.closed(true, Some(NORMAL_CLOSE_CODE), "cancelled before open");
            return;
        }
        result = timeout(CONNECT_TIMEOUT, connect_async(upgrade)) => result,
    };
    let stream = match connected {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            warn!(generation, error = %err, "push connection failed");
            reporter.closed(false, None, err.to_string());
            return;
        }
        Err(_) => {
            warn!(generation, "push connection timed out");
            reporter.closed(false, None, "connect timed out");
            return;
        }
    };

    info!(generation, "push connection open");
    reporter.report(TransportEvent::Opened);

    let (mut write, mut read) = stream.split();
    let period = request.keepalive_interval.max(Duration::from_millis(1));
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session teardown".into(),
                }));
                if timeout(CLOSE_TIMEOUT, write.send(close)).await.is_err() {
                    debug!(generation, "close frame not acknowledged in time");
                }
                reporter.closed(true, Some(NORMAL_CLOSE_CODE), "session teardown");
                break;
            }
            _ = keepalive.tick() => {
                trace!(generation, "keepalive");
                if let Err(err) = write.send(Message::Text(keepalive_frame().into())).await {
                    warn!(generation, error = %err, "keepalive send failed");
                    reporter.closed(false, None, err.to_string());
                    break;
                }
            }
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch_text(&text, reporter),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|frame| u16::from(frame.code));
                    let reason = frame
                        .as_ref()
                        .map(|frame| frame.reason.to_string())
                        .unwrap_or_default();
                    let normal = code == Some(NORMAL_CLOSE_CODE);
                    info!(generation, ?code, %reason, normal, "push connection closed by peer");
                    reporter.closed(normal, code, reason);
                    break;
                }
                Some(Ok(Message::Binary(_))) => debug!(generation, "ignoring binary frame"),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(generation, error = %err, "push connection read failed");
                    reporter.closed(false, None, err.to_string());
                    break;
                }
                None => {
                    warn!(generation, "push connection ended without close frame");
                    reporter.closed(false, None, "stream ended");
                    break;
                }
            }
        }
    }
}

/// Liveness acknowledgements and unknown types stay inside the transport.
fn dispatch_text<T: From<ConnectionEvent>>(text: &str, reporter: &Reporter<T>) {
    match parse_frame(text) {
        Ok(InboundFrame::Message(event)) => reporter.report(TransportEvent::Message(event)),
        Ok(InboundFrame::Pong) => trace!(generation = reporter.generation, "pong"),
        Ok(InboundFrame::Unknown(kind)) => {
            debug!(generation = reporter.generation, %kind, "ignoring unrecognized frame type")
        }
        Err(err) => reporter.report(TransportEvent::Malformed(err)),
    }
}

fn build_upgrade_request(request: &ConnectRequest) -> Result<Request, SyncError> {
    let mut upgrade = request.url.as_str().into_client_request().map_err(|err| {
        SyncError::new(SyncErrorCategory::Config, "invalid_socket_url", err.to_string())
    })?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", request.token)).map_err(|err| {
        SyncError::new(SyncErrorCategory::Auth, "invalid_token", err.to_string())
    })?;
    upgrade.headers_mut().insert(AUTHORIZATION, bearer);
    Ok(upgrade)
}
