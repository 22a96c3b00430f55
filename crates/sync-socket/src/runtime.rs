//! Session runtime: one actor per logged-in session.
//!
//! The actor owns the store, the dedup ledger and the connection state
//! machine. Caller commands and internal inputs (transport reports, timers,
//! finished network calls) are processed one at a time on a single loop, so
//! none of that state is shared or locked. Network calls run in spawned tasks
//! and report back through the input channel.

use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use sync_core::{
    CloseOutcome, ConnectionStateMachine, Conversation, DedupLedger,
    EventStream, HistoryOrder, Message, OutboundSend, OutgoingContent, OutgoingImage,
    RetryPolicy, SendOutcome, SendPipeline, SendReceipt, SyncChannels, SyncCommand, SyncConfig,
    SyncError, SyncErrorCategory, SyncEvent, SyncReconciler, ThreadStore, normalize_error_event,
};
use sync_platform::CredentialSource;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    api::ChatApi,
    connection::{ConnectRequest, ConnectionEvent, ConnectionHandle, TransportEvent, spawn_connection},
};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
const HISTORY_LIMIT_CAP: u16 = 100;

/// Caller-facing surface of a running session.
#[derive(Clone, Debug)]
pub struct SyncHandle {
    channels: SyncChannels,
}

impl SyncHandle {
    pub async fn send(&self, command: SyncCommand) -> Result<(), SyncError> {
        self.channels.send_command(command).await.map_err(SyncError::from)
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Load the conversation list and open the push connection.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::Start).await
    }

    pub async fn refresh_conversations(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::RefreshConversations).await
    }

    pub async fn open_thread(&self, thread_id: impl Into<String>) -> Result<(), SyncError> {
        self.send(SyncCommand::OpenThread {
            thread_id: thread_id.into(),
        })
        .await
    }

    pub async fn close_thread(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::CloseThread).await
    }

    /// Send text to a thread. Blank text is rejected here and never reaches the store.
    pub async fn send_text(
        &self,
        thread_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), SyncError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "empty_message",
                "message text is empty",
            ));
        }
        self.send(SyncCommand::SendText {
            thread_id: thread_id.into(),
            text,
        })
        .await
    }

    pub async fn send_image(
        &self,
        thread_id: impl Into<String>,
        image: OutgoingImage,
    ) -> Result<(), SyncError> {
        self.send(SyncCommand::SendImage {
            thread_id: thread_id.into(),
            image,
        })
        .await
    }

    /// Logout. Closes the connection normally and stops the runtime.
    pub async fn teardown(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::Teardown).await
    }
}

/// Spawn the session runtime on the current tokio runtime.
pub fn spawn_runtime(
    config: SyncConfig,
    socket_url: Url,
    api: Arc<dyn ChatApi>,
    credentials: Arc<dyn CredentialSource>,
) -> SyncHandle {
    let (channels, command_rx) = SyncChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let runtime = SyncRuntime::new(
        config,
        socket_url,
        api,
        credentials,
        channels.clone(),
        command_rx,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    SyncHandle { channels }
}

/// Inputs produced inside the session: transport reports, timers, finished calls.
#[derive(Debug)]
enum RuntimeInput {
    Connection(ConnectionEvent),
    ReconnectDue {
        generation: u64,
    },
    RefreshTick,
    ConversationsLoaded(Result<Vec<Conversation>, SyncError>),
    HistoryLoaded {
        thread_id: String,
        request: u64,
        result: Result<Vec<Message>, SyncError>,
    },
    SendFinished {
        local_id: String,
        result: Result<SendReceipt, SyncError>,
    },
}

impl From<ConnectionEvent> for RuntimeInput {
    fn from(event: ConnectionEvent) -> Self {
        Self::Connection(event)
    }
}

struct SyncRuntime {
    config: SyncConfig,
    socket_url: Url,
    api: Arc<dyn ChatApi>,
    credentials: Arc<dyn CredentialSource>,
    channels: SyncChannels,
    command_rx: mpsc::Receiver<SyncCommand>,
    input_tx: mpsc::UnboundedSender<RuntimeInput>,
    input_rx: mpsc::UnboundedReceiver<RuntimeInput>,
    store: ThreadStore,
    ledger: DedupLedger,
    reconciler: SyncReconciler,
    pipeline: SendPipeline,
    connection: ConnectionStateMachine,
    retry_policy: RetryPolicy,
    transport: Option<ConnectionHandle>,
    in_flight: HashMap<String, OutboundSend>,
    history_request: u64,
    started: bool,
    /// Parent of every timer and background task; cancelled on teardown.
    shutdown: CancellationToken,
}

impl SyncRuntime {
    fn new(
        config: SyncConfig,
        socket_url: Url,
        api: Arc<dyn ChatApi>,
        credentials: Arc<dyn CredentialSource>,
        channels: SyncChannels,
        command_rx: mpsc::Receiver<SyncCommand>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut store = ThreadStore::new(config.timeline_max_items);
        store.subscribe(channels.store_observer());

        Self {
            ledger: DedupLedger::new(config.dedup_window()),
            retry_policy: RetryPolicy::fixed(config.reconnect_delay_ms, config.max_reconnect_attempts),
            config,
            socket_url,
            api,
            credentials,
            channels,
            command_rx,
            input_tx,
            input_rx,
            store,
            reconciler: SyncReconciler::default(),
            pipeline: SendPipeline,
            connection: ConnectionStateMachine::default(),
            transport: None,
            in_flight: HashMap::new(),
            history_request: 0,
            started: false,
            shutdown: CancellationToken::new(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("all handles dropped; tearing down session");
                        self.teardown().await;
                        break;
                    };
                    match self.handle_command(command).await {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => break,
                        Err(err) => self.channels.emit(normalize_error_event(&err)),
                    }
                }
                Some(input) = self.input_rx.recv() => self.handle_input(input),
            }
        }
        info!("sync runtime stopped");
    }

    async fn handle_command(&mut self, command: SyncCommand) -> Result<ControlFlow<()>, SyncError> {
        match command {
            SyncCommand::Start => self.handle_start(),
            SyncCommand::RefreshConversations => self.spawn_conversation_fetch(),
            SyncCommand::OpenThread { thread_id } => self.handle_open_thread(thread_id)?,
            SyncCommand::CloseThread => self.store.close_thread(),
            SyncCommand::SendText { thread_id, text } => {
                self.handle_send(thread_id, OutgoingContent::Text(text))?
            }
            SyncCommand::SendImage { thread_id, image } => {
                self.handle_send(thread_id, OutgoingContent::Image(image))?
            }
            SyncCommand::Teardown => {
                self.teardown().await;
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn handle_input(&mut self, input: RuntimeInput) {
        match input {
            RuntimeInput::Connection(event) => self.handle_connection_event(event),
            RuntimeInput::ReconnectDue { generation } => {
                if self.connection.reconnect_due(generation) {
                    self.open_connection();
                } else {
                    debug!(generation, "stale reconnect timer ignored");
                }
            }
            RuntimeInput::RefreshTick => self.spawn_conversation_fetch(),
            RuntimeInput::ConversationsLoaded(Ok(conversations)) => {
                self.store.replace_conversations(conversations);
            }
            RuntimeInput::ConversationsLoaded(Err(err)) => {
                warn!(code = %err.code, error = %err, "conversation list fetch failed");
                self.channels.emit(normalize_error_event(&err));
            }
            RuntimeInput::HistoryLoaded {
                thread_id,
                request,
                result,
            } => self.handle_history(thread_id, request, result),
            RuntimeInput::SendFinished { local_id, result } => self.handle_send_finished(local_id, result),
        }
    }

    fn handle_start(&mut self) {
        if self.started {
            debug!("session already started");
            return;
        }
        self.started = true;
        self.spawn_conversation_fetch();
        self.spawn_refresh_ticker();
        self.open_connection();
    }

    /// Open the push connection if a credential is available.
    ///
    /// A missing or unreadable credential leaves the session without live
    /// updates; everything else keeps working.
    fn open_connection(&mut self) {
        let token = match self.credentials.session_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!("no session credential; live sync disabled");
                return;
            }
            Err(err) => {
                warn!(error = %err, "credential lookup failed; live sync disabled");
                return;
            }
        };

        let generation = match self.connection.begin_open() {
            Ok(generation) => generation,
            Err(err) => {
                debug!(code = %err.code, "open request ignored");
                return;
            }
        };
        self.channels
            .emit(SyncEvent::ConnectionChanged(self.connection.state()));

        let request = ConnectRequest {
            url: self.socket_url.clone(),
            token,
            keepalive_interval: self.config.keepalive_interval(),
        };
        self.transport = Some(spawn_connection(request, generation, self.input_tx.clone()));
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent { generation, event } = event;
        match event {
            TransportEvent::Opened => match self.connection.on_open(generation) {
                Ok(state) => self.channels.emit(SyncEvent::ConnectionChanged(state)),
                Err(_) => debug!(generation, "stale open report ignored"),
            },
            TransportEvent::Message(message) => {
                if generation != self.connection.generation() {
                    debug!(generation, "message from superseded connection ignored");
                    return;
                }
                self.reconciler
                    .apply_message_event(&mut self.store, &mut self.ledger, message, Instant::now());
            }
            TransportEvent::Malformed(err) => self.reconciler.record_dropped(&err),
            TransportEvent::Closed {
                normal,
                code,
                reason,
            } => {
                debug!(generation, normal, ?code, %reason, "transport closed");
                self.handle_closed(generation, normal);
            }
        }
    }

    fn handle_closed(&mut self, generation: u64, normal: bool) {
        let outcome = self
            .connection
            .on_closed(generation, normal, &self.retry_policy);
        if outcome == CloseOutcome::Stale {
            debug!(generation, "stale close report ignored");
            return;
        }
        if self
            .transport
            .as_ref()
            .is_some_and(|transport| transport.generation() == generation)
        {
            self.transport = None;
        }
        self.channels
            .emit(SyncEvent::ConnectionChanged(self.connection.state()));

        match outcome {
            CloseOutcome::Reconnect {
                attempt,
                delay,
                generation,
            } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                self.schedule_reconnect(generation, delay);
            }
            CloseOutcome::Abandon { attempts } => {
                warn!(attempts, "reconnection abandoned");
                self.channels
                    .emit(SyncEvent::ConnectionAbandoned { attempts });
            }
            CloseOutcome::StayClosed | CloseOutcome::Stale => {}
        }
    }

    fn schedule_reconnect(&self, generation: u64, delay: Duration) {
        let input_tx = self.input_tx.clone();
        let stop = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = input_tx.send(RuntimeInput::ReconnectDue { generation });
                }
            }
        });
    }

    fn spawn_refresh_ticker(&self) {
        let input_tx = self.input_tx.clone();
        let stop = self.shutdown.child_token();
        let period = self.config.conversation_refresh_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if input_tx.send(RuntimeInput::RefreshTick).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_conversation_fetch(&self) {
        let api = Arc::clone(&self.api);
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = api.list_conversations().await;
            let _ = input_tx.send(RuntimeInput::ConversationsLoaded(result));
        });
    }

    fn handle_open_thread(&mut self, thread_id: String) -> Result<(), SyncError> {
        if thread_id.trim().is_empty() {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "missing_thread",
                "thread id is empty",
            ));
        }

        self.store.open_thread(thread_id.clone());
        self.history_request = self.history_request.wrapping_add(1);
        let request = self.history_request;
        let limit = self.config.history_limit.clamp(1, HISTORY_LIMIT_CAP);
        let api = Arc::clone(&self.api);
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = api
                .fetch_history(&thread_id, limit, HistoryOrder::Descending)
                .await;
            let _ = input_tx.send(RuntimeInput::HistoryLoaded {
                thread_id,
                request,
                result,
            });
        });
        Ok(())
    }

    fn handle_history(
        &mut self,
        thread_id: String,
        request: u64,
        result: Result<Vec<Message>, SyncError>,
    ) {
        if request != self.history_request || !self.store.is_open(&thread_id) {
            debug!(%thread_id, request, "stale history result ignored");
            return;
        }
        match result {
            Ok(mut history) => {
                // Fetched newest first; displayed oldest first.
                history.reverse();
                self.reconciler.apply_history(
                    &mut self.store,
                    &mut self.ledger,
                    &thread_id,
                    history,
                    Instant::now(),
                );
            }
            Err(err) => {
                warn!(%thread_id, code = %err.code, error = %err, "history fetch failed");
                self.channels.emit(normalize_error_event(&err));
            }
        }
    }

    fn handle_send(&mut self, thread_id: String, content: OutgoingContent) -> Result<(), SyncError> {
        let send = self.pipeline.begin(
            &mut self.store,
            &mut self.ledger,
            &thread_id,
            content,
            Instant::now(),
            now_ms(),
        )?;

        let api = Arc::clone(&self.api);
        let input_tx = self.input_tx.clone();
        let local_id = send.local_id.clone();
        let content = send.content.clone();
        self.in_flight.insert(local_id.clone(), send);
        tokio::spawn(async move {
            let result = api.send_message(&thread_id, &content).await;
            let _ = input_tx.send(RuntimeInput::SendFinished { local_id, result });
        });
        Ok(())
    }

    fn handle_send_finished(&mut self, local_id: String, result: Result<SendReceipt, SyncError>) {
        let Some(send) = self.in_flight.remove(&local_id) else {
            debug!(%local_id, "completion for unknown send ignored");
            return;
        };
        let outcome = SendOutcome::from(result);
        let ack = self.pipeline.complete(
            &mut self.store,
            &mut self.ledger,
            &send,
            &outcome,
            now_ms(),
        );
        self.channels.emit(SyncEvent::SendAck(ack));
    }

    async fn teardown(&mut self) {
        let state = self.connection.teardown();
        self.shutdown.cancel();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.ledger.clear();
        self.in_flight.clear();
        info!("session torn down");
        self.channels.emit(SyncEvent::ConnectionChanged(state));
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
