//! Dual-mode transport: websocket channel preferred, REST polling fallback.
//!
//! [`Transport`] owns one logical connection to the active session. A spawned
//! driver task runs the sockets and timers and executes the [`Effect`]s
//! produced by [`ConnectionState::transition`]. Everything it receives comes
//! out of the [`Inbound`] stream returned by [`SessionTransport::attach`].
//!
//! Every timer body resolves the session id through the [`SessionCellReader`]
//! at fire time. A driver whose generation is no longer current stops without
//! touching the network.
//!
//! ## Channel URL
//!
//! The channel endpoint is derived from the REST base URL:
//! `http(s)://host` → `ws(s)://host/ws/sessions/{id}?token={api_key}` (the
//! `token` parameter is omitted when no key is configured).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::SessionApi;
use crate::config::TransportConfig;
use crate::connection::{ConnectionEvent, ConnectionMode, ConnectionState, Effect};
use crate::error::TransportError;
use crate::protocol::{self, ClientCommand, ServerEvent, SessionState};
use crate::session_cell::SessionCellReader;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;
type Connecting = Pin<Box<dyn Future<Output = Result<WsStream, tungstenite::Error>> + Send>>;
type Outbound = (ClientCommand, oneshot::Sender<Result<(), TransportError>>);

/// Capacity of the inbound queue handed to the controller.
const INBOUND_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// Everything the transport delivers to its owner.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A channel event (pongs are consumed by the transport).
    Event(ServerEvent),
    /// A polling snapshot.
    Snapshot(SessionState),
    ModeChanged(ConnectionMode),
}

/// The transport seam the session controller is written against.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Attach to `session_id`, replacing any previous attachment.
    async fn attach(&mut self, session_id: &str) -> Result<mpsc::Receiver<Inbound>, TransportError>;
    /// Stop all timers and close the channel. Returns once the driver is gone.
    async fn detach(&mut self);
    /// Deliver a command over whichever transport is viable.
    async fn send(&self, command: ClientCommand) -> Result<(), TransportError>;
    fn state(&self) -> ConnectionState;
}

/// Channel + polling transport backed by `tokio-tungstenite` and a
/// [`SessionApi`].
pub struct Transport {
    api: Arc<dyn SessionApi>,
    config: TransportConfig,
    base_url: String,
    api_key: Option<String>,
    cell: SessionCellReader,
    state_tx: watch::Sender<ConnectionState>,
    outbound: Option<mpsc::Sender<Outbound>>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Transport {
    pub fn new(
        api: Arc<dyn SessionApi>,
        base_url: &str,
        api_key: Option<String>,
        config: TransportConfig,
        cell: SessionCellReader,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::new());
        Self {
            api,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            cell,
            state_tx,
            outbound: None,
            cancel: CancellationToken::new(),
            driver: None,
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.state_tx.borrow().mode
    }
}

#[async_trait]
impl SessionTransport for Transport {
    async fn attach(&mut self, session_id: &str) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        self.detach().await;

        // Validate before spawning so a bad base URL surfaces here.
        build_channel_url(&self.base_url, session_id, self.api_key.as_deref())?;

        let generation = self.cell.generation();
        if self.cell.resolve(generation).as_deref() != Some(session_id) {
            warn!("Transport: attach({session_id}) does not match the active session");
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        let driver = Driver {
            api: Arc::clone(&self.api),
            config: self.config.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            cell: self.cell.clone(),
            generation,
            state: ConnectionState::new(),
            state_tx: self.state_tx.clone(),
            inbound: inbound_tx,
            outbound: outbound_rx,
            cancel: cancel.clone(),
            events: Vec::new(),
            connecting: None,
            sink: None,
            reader: None,
            open_timer: None,
            reconnect_timer: None,
            poll: None,
            poll_task: None,
            upgrade: None,
            heartbeat: None,
            published_mode: ConnectionMode::Disconnected,
        };

        info!("Transport: attaching to session {session_id}");
        self.driver = Some(tokio::spawn(driver.run()));
        self.outbound = Some(outbound_tx);
        self.cancel = cancel;
        Ok(inbound_rx)
    }

    async fn detach(&mut self) {
        self.outbound = None;
        self.cancel.cancel();
        if let Some(handle) = self.driver.take() {
            if let Err(e) = handle.await {
                warn!("Transport: driver ended abnormally: {e}");
            }
            debug!("Transport: detached");
        }
        self.state_tx.send_replace(ConnectionState::new());
    }

    async fn send(&self, command: ClientCommand) -> Result<(), TransportError> {
        let mode = self.mode();
        let Some(outbound) = self.outbound.as_ref().filter(|_| mode != ConnectionMode::Disconnected)
        else {
            warn!(
                "Transport: dropping '{}' command, no viable transport (mode: {mode})",
                command.name()
            );
            return Err(TransportError::NotViable { mode });
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        outbound
            .send((command, reply_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Map the REST base URL onto the session's channel endpoint.
pub fn build_channel_url(
    base_url: &str,
    session_id: &str,
    api_key: Option<&str>,
) -> Result<String, TransportError> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if base.starts_with("https://") {
        base.replacen("https://", "wss://", 1)
    } else if base.starts_with("http://") {
        base.replacen("http://", "ws://", 1)
    } else {
        return Err(TransportError::InvalidUrl(base.to_string()));
    };
    Ok(match api_key {
        Some(key) => format!("{ws_base}/ws/sessions/{session_id}?token={key}"),
        None => format!("{ws_base}/ws/sessions/{session_id}"),
    })
}

/// Task-side half of [`Transport`]; one per attachment.
struct Driver {
    api: Arc<dyn SessionApi>,
    config: TransportConfig,
    base_url: String,
    api_key: Option<String>,
    cell: SessionCellReader,
    generation: u64,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    /// Events raised while applying effects, fed back before the next select.
    events: Vec<ConnectionEvent>,
    connecting: Option<Connecting>,
    sink: Option<WsSink>,
    reader: Option<WsReader>,
    open_timer: Option<Pin<Box<Sleep>>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    poll: Option<Interval>,
    poll_task: Option<JoinHandle<()>>,
    upgrade: Option<Interval>,
    heartbeat: Option<Interval>,
    published_mode: ConnectionMode,
}

impl Driver {
    async fn run(mut self) {
        self.dispatch(ConnectionEvent::Attach).await;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.dispatch(ConnectionEvent::Detach).await;
                    break;
                }

                result = opt_connect(&mut self.connecting) => {
                    self.connecting = None;
                    if !self.is_current() {
                        break;
                    }
                    match result {
                        Ok(ws) => {
                            let (sink, reader) = ws.split();
                            self.sink = Some(sink);
                            self.reader = Some(reader);
                            info!("Transport: channel open");
                            self.dispatch(ConnectionEvent::ChannelOpened).await;
                        }
                        Err(e) => {
                            debug!("Transport: channel open failed: {e}");
                            self.dispatch(ConnectionEvent::ChannelClosed).await;
                        }
                    }
                }

                frame = opt_next(&mut self.reader) => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if !self.on_text(&text).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Transport: channel closed by server");
                            self.drop_channel();
                            self.dispatch(ConnectionEvent::ChannelClosed).await;
                        }
                        Some(Err(e)) => {
                            warn!("Transport: channel error: {e}");
                            self.drop_channel();
                            self.dispatch(ConnectionEvent::ChannelClosed).await;
                        }
                        Some(Ok(_)) => {} // Binary/Ping/Pong frames
                    }
                }

                request = self.outbound.recv() => {
                    let Some((command, reply)) = request else { break };
                    self.deliver(command, reply).await;
                }

                () = opt_sleep(&mut self.open_timer) => {
                    self.open_timer = None;
                    if !self.is_current() {
                        break;
                    }
                    info!(
                        "Transport: channel not open after {}ms",
                        self.config.connect_timeout_ms
                    );
                    self.dispatch(ConnectionEvent::OpenTimedOut).await;
                }

                () = opt_sleep(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    if !self.is_current() {
                        break;
                    }
                    info!(
                        "Transport: reconnecting (attempt {}/{})",
                        self.state.reconnect_attempt, self.config.reconnect_max_attempts
                    );
                    self.dispatch(ConnectionEvent::ReconnectDue).await;
                }

                () = opt_tick(&mut self.poll) => {
                    if !self.is_current() {
                        break;
                    }
                    self.spawn_poll();
                }

                () = opt_tick(&mut self.upgrade) => {
                    if !self.is_current() {
                        break;
                    }
                    debug!("Transport: trying to upgrade back to channel");
                    self.dispatch(ConnectionEvent::UpgradeDue).await;
                }

                () = opt_tick(&mut self.heartbeat) => {
                    if !self.is_current() {
                        break;
                    }
                    self.dispatch(ConnectionEvent::HeartbeatDue).await;
                    if self.state.missed_pongs > 0 {
                        warn!(
                            "Transport: {} heartbeat(s) unanswered",
                            self.state.missed_pongs
                        );
                    }
                }
            }
        }

        self.shutdown();
    }

    fn session_id(&self) -> Option<String> {
        self.cell.resolve(self.generation)
    }

    fn is_current(&self) -> bool {
        let current = self.session_id().is_some();
        if !current {
            debug!("Transport: session changed, stopping stale driver");
        }
        current
    }

    /// Feed `event` (and anything raised while applying its effects) through
    /// the state machine.
    async fn dispatch(&mut self, event: ConnectionEvent) {
        self.events.push(event);
        self.drain().await;
    }

    async fn drain(&mut self) {
        while !self.events.is_empty() {
            let event = self.events.remove(0);
            let (next, effects) = self.state.clone().transition(event, &self.config);
            self.state = next;
            for effect in effects {
                self.apply(effect).await;
            }
        }
        self.publish();
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::OpenChannel => self.open_channel(),
            Effect::AbandonChannel => self.connecting = None,
            Effect::CloseChannel => self.close_channel().await,
            Effect::ArmOpenTimer(after) => {
                self.open_timer = Some(Box::pin(tokio::time::sleep(after)));
            }
            Effect::DisarmOpenTimer => self.open_timer = None,
            Effect::StartPolling => {
                info!(
                    "Transport: polling every {}ms",
                    self.config.poll_interval_ms
                );
                // First tick completes immediately.
                let mut poll = tokio::time::interval(self.config.poll_interval());
                poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.poll = Some(poll);
            }
            Effect::StopPolling => {
                self.poll = None;
                if let Some(task) = self.poll_task.take() {
                    task.abort();
                }
            }
            Effect::ScheduleReconnect(after) => {
                info!(
                    "Transport: reconnect attempt {} in {}ms",
                    self.state.reconnect_attempt,
                    after.as_millis()
                );
                self.reconnect_timer = Some(Box::pin(tokio::time::sleep(after)));
            }
            Effect::StartUpgradeTimer => {
                if self.state.budget_exhausted {
                    warn!(
                        "Transport: reconnect budget exhausted, staying on polling \
                         (channel retry every {}s)",
                        self.config.channel_retry_interval_secs
                    );
                }
                self.upgrade = Some(delayed_interval(self.config.channel_retry_interval()));
            }
            Effect::StopUpgradeTimer => self.upgrade = None,
            Effect::StartHeartbeat => {
                self.heartbeat = Some(delayed_interval(self.config.heartbeat_interval()));
            }
            Effect::StopHeartbeat => self.heartbeat = None,
            Effect::Subscribe => {
                if let Some(session_id) = self.session_id() {
                    if let Err(e) = self.write(&ClientCommand::Subscribe { session_id }).await {
                        warn!("Transport: subscribe not sent: {e}");
                    }
                }
            }
            Effect::SendPing => {
                if let Err(e) = self.write(&ClientCommand::Ping).await {
                    debug!("Transport: ping not sent: {e}");
                }
            }
            Effect::CancelAllTimers => {
                self.open_timer = None;
                self.reconnect_timer = None;
                self.poll = None;
                self.upgrade = None;
                self.heartbeat = None;
                if let Some(task) = self.poll_task.take() {
                    task.abort();
                }
            }
        }
    }

    fn open_channel(&mut self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let url = match build_channel_url(&self.base_url, &session_id, self.api_key.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                warn!("Transport: {e}");
                self.events.push(ConnectionEvent::ChannelClosed);
                return;
            }
        };
        debug!("Transport: opening channel for session {session_id}");
        self.connecting = Some(Box::pin(async move {
            tokio_tungstenite::connect_async(url)
                .await
                .map(|(ws, _response)| ws)
        }));
    }

    async fn close_channel(&mut self) {
        self.connecting = None;
        self.reader = None;
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }

    fn drop_channel(&mut self) {
        self.sink = None;
        self.reader = None;
    }

    /// Write a frame; a failed write is handled as a channel close.
    async fn write(&mut self, command: &ClientCommand) -> Result<(), TransportError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(TransportError::Closed);
        };
        let text = serde_json::to_string(command)?;
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!("Transport: write failed: {e}");
            self.drop_channel();
            self.events.push(ConnectionEvent::ChannelClosed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Handle one text frame. Returns `false` when the owner is gone.
    async fn on_text(&mut self, text: &str) -> bool {
        let Some(event) = protocol::parse_event(text) else {
            return true;
        };
        if matches!(event, ServerEvent::Pong) {
            self.dispatch(ConnectionEvent::PongReceived).await;
            return true;
        }
        // A full queue must not block detach.
        tokio::select! {
            sent = self.inbound.send(Inbound::Event(event)) => sent.is_ok(),
            () = self.cancel.cancelled() => true,
        }
    }

    async fn deliver(
        &mut self,
        command: ClientCommand,
        reply: oneshot::Sender<Result<(), TransportError>>,
    ) {
        if self.sink.is_some() {
            match self.write(&command).await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                    return;
                }
                Err(e @ TransportError::Encode(_)) => {
                    warn!("Transport: failed to encode '{}': {e}", command.name());
                    let _ = reply.send(Err(e));
                    return;
                }
                // The failed write queued a close; settle the state before falling back.
                Err(_) => self.drain().await,
            }
        }

        let Some(session_id) = self.session_id() else {
            let _ = reply.send(Err(TransportError::Closed));
            return;
        };
        if self.state.is_polling() && !command.is_channel_only() {
            debug!("Transport: sending '{}' over REST", command.name());
            let api = Arc::clone(&self.api);
            tokio::spawn(async move {
                let result = api
                    .post_command(&session_id, &command)
                    .await
                    .map_err(TransportError::from);
                let _ = reply.send(result);
            });
            return;
        }

        let mode = self.state.mode;
        warn!(
            "Transport: cannot deliver '{}' (mode: {mode})",
            command.name()
        );
        let _ = reply.send(Err(TransportError::NotViable { mode }));
    }

    fn spawn_poll(&mut self) {
        if self.poll_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let api = Arc::clone(&self.api);
        let cell = self.cell.clone();
        let generation = self.generation;
        let inbound = self.inbound.clone();
        self.poll_task = Some(tokio::spawn(async move {
            let Some(session_id) = cell.resolve(generation) else {
                return;
            };
            match api.get_session_state(&session_id).await {
                Ok(snapshot) => {
                    // Re-check: the session may have switched during the request.
                    if cell.resolve(generation).is_some() {
                        let _ = inbound.send(Inbound::Snapshot(snapshot)).await;
                    }
                }
                Err(e) => warn!("Transport: poll failed, retrying next tick: {e}"),
            }
        }));
    }

    fn publish(&mut self) {
        self.state_tx.send_replace(self.state.clone());
        if self.state.mode != self.published_mode {
            info!(
                "Transport: mode {} -> {}",
                self.published_mode, self.state.mode
            );
            self.published_mode = self.state.mode;
            if let Err(e) = self.inbound.try_send(Inbound::ModeChanged(self.state.mode)) {
                debug!("Transport: mode change not delivered: {e}");
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.connecting = None;
        self.drop_channel();
    }
}

fn delayed_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn opt_connect(connecting: &mut Option<Connecting>) -> Result<WsStream, tungstenite::Error> {
    match connecting {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn opt_next(reader: &mut Option<WsReader>) -> Option<Result<Message, tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

async fn opt_sleep(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn opt_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
