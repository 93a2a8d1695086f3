//! Client connection manager
//!
//! One actor task owns the socket, the timers and the [`ClientState`].
//! Handles talk to it over an mpsc channel. Connection status goes out on a
//! `watch` channel and everything else on a `broadcast` channel.
//!
//! Each connect attempt gets an epoch. Link events from an older epoch are
//! dropped, so a socket that was replaced can never touch current state.

use std::time::Duration;

use agentrelay_protocol::{close_code, Frame, RemoteCommand, UiFrame};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{ClientEvent, ConnectionSnapshot, ConnectionStatus};
use crate::state::{ClientSnapshot, ClientState, Effect};
use crate::timers::{TimerFired, TimerKey, Timers};

const COMMAND_QUEUE_CAPACITY: usize = 64;
const LINK_QUEUE_CAPACITY: usize = 256;
const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const TIMER_QUEUE_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Delay before reconnect attempt `attempt` (0-based): `min(base * 2^attempt, cap)`.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

enum Command {
    SendFrame(Frame),
    Reconnect,
    Disconnect,
    Shutdown,
    CreateTask {
        agent_id: String,
        text: String,
        images: Vec<String>,
        reply: oneshot::Sender<String>,
    },
    SendToTask {
        agent_id: String,
        task_id: String,
        text: String,
        images: Vec<String>,
    },
    RemoteCommand {
        agent_id: String,
        command: RemoteCommand,
        reply: oneshot::Sender<String>,
    },
    RequestActiveTaskIds {
        agent_id: String,
    },
    Approve {
        task_id: String,
    },
    Deny {
        task_id: String,
    },
    RetryNow {
        task_id: String,
    },
    CancelRetry {
        task_id: String,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
}

enum LinkEvent {
    Connected {
        epoch: u64,
        outbound: mpsc::Sender<Message>,
    },
    ConnectFailed {
        epoch: u64,
        error: String,
    },
    Frame {
        epoch: u64,
        text: String,
    },
    Closed {
        epoch: u64,
        code: Option<u16>,
    },
}

impl LinkEvent {
    fn epoch(&self) -> u64 {
        match self {
            LinkEvent::Connected { epoch, .. }
            | LinkEvent::ConnectFailed { epoch, .. }
            | LinkEvent::Frame { epoch, .. }
            | LinkEvent::Closed { epoch, .. } => *epoch,
        }
    }
}

struct Link {
    outbound: Option<mpsc::Sender<Message>>,
    task: JoinHandle<()>,
}

pub struct ClientConnectionManager;

impl ClientConnectionManager {
    /// Start the actor and begin connecting right away.
    pub fn spawn(config: ClientConfig) -> ClientHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionSnapshot::default());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link_tx, link_rx) = mpsc::channel(LINK_QUEUE_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_QUEUE_CAPACITY);

        let actor = Actor {
            state: ClientState::new(&config),
            config,
            commands: command_rx,
            link_tx,
            link_rx,
            timers: Timers::new(timer_tx),
            timer_rx,
            status: status_tx,
            events: event_tx.clone(),
            epoch: 0,
            link: None,
            closing: false,
            held_closed: false,
        };
        tokio::spawn(actor.run());

        ClientHandle {
            commands: command_tx,
            status: status_rx,
            events: event_tx,
        }
    }
}

/// Cheap, cloneable handle to the connection actor. The actor stops when
/// every handle is dropped.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionSnapshot>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientHandle {
    pub fn status(&self) -> ConnectionSnapshot {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Send a raw frame. Dropped with a warning while the socket is not open;
    /// after `disconnect()` it does not reopen the socket either.
    pub async fn send_message(&self, frame: impl Into<Frame>) -> Result<(), ClientError> {
        self.command(Command::SendFrame(frame.into())).await
    }

    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Reconnect).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.command(Command::Shutdown).await
    }

    /// Start a task; returns its local id until the agent confirms it.
    pub async fn create_task(
        &self,
        agent_id: &str,
        text: &str,
        images: Vec<String>,
    ) -> Result<String, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::CreateTask {
            agent_id: agent_id.to_string(),
            text: text.to_string(),
            images,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn send_to_task(
        &self,
        agent_id: &str,
        task_id: &str,
        text: &str,
        images: Vec<String>,
    ) -> Result<(), ClientError> {
        self.command(Command::SendToTask {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            text: text.to_string(),
            images,
        })
        .await
    }

    /// Returns the request id echoed by the matching `CommandResponse`.
    pub async fn remote_command(
        &self,
        agent_id: &str,
        command: RemoteCommand,
    ) -> Result<String, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::RemoteCommand {
            agent_id: agent_id.to_string(),
            command,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn request_active_task_ids(&self, agent_id: &str) -> Result<(), ClientError> {
        self.command(Command::RequestActiveTaskIds {
            agent_id: agent_id.to_string(),
        })
        .await
    }

    pub async fn approve(&self, task_id: &str) -> Result<(), ClientError> {
        self.command(Command::Approve {
            task_id: task_id.to_string(),
        })
        .await
    }

    pub async fn deny(&self, task_id: &str) -> Result<(), ClientError> {
        self.command(Command::Deny {
            task_id: task_id.to_string(),
        })
        .await
    }

    pub async fn retry_now(&self, task_id: &str) -> Result<(), ClientError> {
        self.command(Command::RetryNow {
            task_id: task_id.to_string(),
        })
        .await
    }

    pub async fn cancel_retry(&self, task_id: &str) -> Result<(), ClientError> {
        self.command(Command::CancelRetry {
            task_id: task_id.to_string(),
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

struct Actor {
    config: ClientConfig,
    state: ClientState,
    commands: mpsc::Receiver<Command>,
    link_tx: mpsc::Sender<LinkEvent>,
    link_rx: mpsc::Receiver<LinkEvent>,
    timers: Timers,
    timer_rx: mpsc::Receiver<TimerFired>,
    status: watch::Sender<ConnectionSnapshot>,
    events: broadcast::Sender<ClientEvent>,
    epoch: u64,
    link: Option<Link>,
    /// A close was requested locally; the next `Closed` is expected.
    closing: bool,
    /// The user disconnected. Sends no longer reopen the socket until a
    /// `reconnect()`.
    held_closed: bool,
}

impl Actor {
    async fn run(mut self) {
        self.connect();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.link_rx.recv() => self.handle_link(event),
                Some(fired) = self.timer_rx.recv() => self.handle_timer(fired),
            }
        }
        self.teardown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendFrame(frame) => {
                self.send_frame(frame);
            }
            Command::Reconnect => {
                info!(
                    component = "client_connection",
                    event = "client.reconnect.requested",
                    "Manual reconnect"
                );
                self.timers.cancel(&TimerKey::Reconnect);
                self.status.send_modify(|snapshot| {
                    snapshot.attempts = 0;
                    snapshot.gave_up = false;
                });
                self.connect();
            }
            Command::Disconnect => self.disconnect(),
            Command::Shutdown => {}
            Command::CreateTask {
                agent_id,
                text,
                images,
                reply,
            } => {
                let (task_id, effects) = self.state.create_task(&agent_id, &text, images);
                self.run_effects(effects);
                let _ = reply.send(task_id);
            }
            Command::SendToTask {
                agent_id,
                task_id,
                text,
                images,
            } => {
                let effects = self.state.send_to_task(&agent_id, &task_id, &text, images);
                self.run_effects(effects);
            }
            Command::RemoteCommand {
                agent_id,
                command,
                reply,
            } => {
                let (request_id, effects) = self.state.remote_command(&agent_id, command);
                self.run_effects(effects);
                let _ = reply.send(request_id);
            }
            Command::RequestActiveTaskIds { agent_id } => {
                let effects = self.state.request_active_task_ids(&agent_id);
                self.run_effects(effects);
            }
            Command::Approve { task_id } => {
                let effects = self.state.approve(&task_id);
                self.run_effects(effects);
            }
            Command::Deny { task_id } => {
                let effects = self.state.deny(&task_id);
                self.run_effects(effects);
            }
            Command::RetryNow { task_id } => {
                let effects = self.state.retry_now(&task_id);
                self.run_effects(effects);
            }
            Command::CancelRetry { task_id } => {
                let effects = self.state.cancel_retry(&task_id);
                self.run_effects(effects);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }

    fn handle_link(&mut self, event: LinkEvent) {
        if event.epoch() != self.epoch {
            debug!(
                component = "client_connection",
                event = "client.link.stale",
                epoch = event.epoch(),
                current = self.epoch,
                "Dropping event from replaced socket"
            );
            return;
        }

        match event {
            LinkEvent::Connected { outbound, .. } => {
                if let Some(link) = self.link.as_mut() {
                    link.outbound = Some(outbound);
                }
                self.status.send_modify(|snapshot| {
                    snapshot.status = ConnectionStatus::Open;
                    snapshot.attempts = 0;
                    snapshot.gave_up = false;
                });
                info!(
                    component = "client_connection",
                    event = "client.connection.open",
                    url = %self.config.url,
                    "Connected to relay"
                );
                let effects = self.state.on_connected();
                self.run_effects(effects);
                self.timers
                    .every(TimerKey::Heartbeat, self.config.heartbeat_interval());
            }
            LinkEvent::ConnectFailed { error, .. } => {
                warn!(
                    component = "client_connection",
                    event = "client.connection.failed",
                    url = %self.config.url,
                    error = %error,
                    "Connect attempt failed"
                );
                self.link_down(None);
            }
            LinkEvent::Frame { text, .. } => match Frame::parse(&text) {
                Ok(frame) => {
                    let effects = self.state.apply_frame(frame);
                    self.run_effects(effects);
                }
                Err(error) => {
                    warn!(
                        component = "client_connection",
                        event = "client.frame.malformed",
                        error = %error,
                        "Dropping unparseable frame"
                    );
                }
            },
            LinkEvent::Closed { code, .. } => {
                info!(
                    component = "client_connection",
                    event = "client.connection.closed",
                    code = ?code,
                    "Connection closed"
                );
                self.link_down(code);
            }
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(&fired) {
            return;
        }
        match fired.key {
            TimerKey::Heartbeat => {
                self.send_frame(Frame::Ui(UiFrame::Ping { timestamp: None }));
            }
            TimerKey::Reconnect => self.connect(),
            TimerKey::Countdown(key) => {
                let effects = self.state.countdown_tick(&key);
                self.run_effects(effects);
            }
            TimerKey::Retry(task_id) => {
                let effects = self.state.retry_fired(&task_id);
                self.run_effects(effects);
            }
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(frame) => {
                    self.send_frame(Frame::Ui(frame));
                }
                Effect::Notify(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
                Effect::StartCountdown(key) => {
                    self.timers.every(TimerKey::Countdown(key), COUNTDOWN_TICK);
                }
                Effect::StopCountdown(key) => {
                    self.timers.cancel(&TimerKey::Countdown(key));
                }
                Effect::ScheduleRetry { task_id, delay } => {
                    self.timers.once(TimerKey::Retry(task_id), delay);
                }
                Effect::CancelRetry { task_id } => {
                    self.timers.cancel(&TimerKey::Retry(task_id));
                }
            }
        }
    }

    /// Queue `frame` on the open socket. At most once: nothing is buffered
    /// while disconnected.
    fn send_frame(&mut self, frame: Frame) -> bool {
        let open = self.status.borrow().status == ConnectionStatus::Open;
        let outbound = self.link.as_ref().and_then(|link| link.outbound.as_ref());
        let Some(outbound) = outbound.filter(|_| open) else {
            warn!(
                component = "client_connection",
                event = "client.send.not_open",
                "Socket not open, frame dropped"
            );
            if !self.held_closed
                && self.link.is_none()
                && !self.timers.is_armed(&TimerKey::Reconnect)
            {
                self.connect();
            }
            return false;
        };

        let text = match frame.to_json() {
            Ok(text) => text,
            Err(error) => {
                warn!(
                    component = "client_connection",
                    event = "client.send.encode_failed",
                    error = %error,
                    "Failed to encode frame"
                );
                return false;
            }
        };
        match outbound.try_send(Message::Text(text.into())) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    component = "client_connection",
                    event = "client.send.queue_failed",
                    error = %error,
                    "Outbound queue rejected frame"
                );
                false
            }
        }
    }

    fn connect(&mut self) {
        self.abort_link();
        self.closing = false;
        self.held_closed = false;
        self.epoch += 1;
        let epoch = self.epoch;
        self.status.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Connecting;
        });
        debug!(
            component = "client_connection",
            event = "client.connection.connecting",
            epoch,
            url = %self.config.url,
            "Connecting"
        );
        let task = tokio::spawn(run_link(epoch, self.config.connect_url(), self.link_tx.clone()));
        self.link = Some(Link {
            outbound: None,
            task,
        });
    }

    fn disconnect(&mut self) {
        self.held_closed = true;
        self.timers.cancel(&TimerKey::Heartbeat);
        self.timers.cancel(&TimerKey::Reconnect);
        let effects = self.state.on_disconnected();
        self.run_effects(effects);

        let outbound = self.link.as_ref().and_then(|link| link.outbound.clone());
        let Some(outbound) = outbound else {
            // Nothing open yet; drop the in-flight attempt
            self.abort_link();
            self.epoch += 1;
            self.status.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Disconnected;
            });
            return;
        };

        self.closing = true;
        self.status.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Closing;
        });
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        }));
        if outbound.try_send(close).is_err() {
            self.abort_link();
            self.epoch += 1;
            self.closing = false;
            self.status.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Disconnected;
            });
        }
    }

    fn link_down(&mut self, code: Option<u16>) {
        self.link = None;
        self.timers.cancel(&TimerKey::Heartbeat);

        if std::mem::take(&mut self.closing) || !close_code::is_abnormal(code) {
            self.status.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Disconnected;
            });
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let attempts = self.status.borrow().attempts;
        let max = self.config.reconnect.max_attempts;
        if attempts >= max {
            warn!(
                component = "client_connection",
                event = "client.reconnect.exhausted",
                attempts,
                "Giving up on reconnecting"
            );
            self.status.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Disconnected;
                snapshot.gave_up = true;
            });
            let _ = self.events.send(ClientEvent::ReconnectExhausted { attempts });
            return;
        }

        let delay = reconnect_delay(
            attempts,
            Duration::from_millis(self.config.reconnect.base_interval_ms),
            Duration::from_millis(self.config.reconnect.max_interval_ms),
        );
        info!(
            component = "client_connection",
            event = "client.reconnect.scheduled",
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.timers.once(TimerKey::Reconnect, delay);
        self.status.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Disconnected;
            snapshot.attempts = attempts + 1;
        });
    }

    fn abort_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.task.abort();
        }
    }

    fn teardown(&mut self) {
        self.timers.cancel_all();
        self.abort_link();
        self.status.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Disconnected;
        });
        info!(
            component = "client_connection",
            event = "client.shutdown",
            "Connection manager stopped"
        );
    }
}

/// Dial `url` and pump the socket until it closes. Reports back to the actor
/// tagged with `epoch`.
async fn run_link(epoch: u64, url: String, events: mpsc::Sender<LinkEvent>) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(error) => {
            let _ = events
                .send(LinkEvent::ConnectFailed {
                    epoch,
                    error: error.to_string(),
                })
                .await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    if events
        .send(LinkEvent::Connected {
            epoch,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let code = loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else { break None };
                if let Err(error) = ws_tx.send(message).await {
                    debug!(
                        component = "client_connection",
                        event = "client.send.failed",
                        error = %error,
                        "Socket write failed"
                    );
                    break None;
                }
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_owned();
                    if events.send(LinkEvent::Frame { epoch, text }).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|frame| u16::from(frame.code));
                }
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(
                        component = "client_connection",
                        event = "client.read.failed",
                        error = %error,
                        "Socket read failed"
                    );
                    break None;
                }
                None => break None,
            }
        }
    };

    let _ = events.send(LinkEvent::Closed { epoch, code }).await;
}
