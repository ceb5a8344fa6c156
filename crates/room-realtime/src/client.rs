//! WebSocket realtime client.

use crate::messages::{events, PhoenixMessage, PHOENIX_TOPIC};
use crate::{ChangeEvent, ChangeFeed, ChangeFilter, RealtimeError, RealtimeResult, Subscription};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use room_config_and_utils::{Config, SessionHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Realtime client configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Socket URL (e.g., wss://xyz.supabase.co/realtime/v1/websocket?apikey=..&vsn=1.0.0).
    pub url: String,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Base reconnect delay in seconds.
    pub reconnect_base_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub reconnect_max_delay_secs: u64,
    /// Maximum consecutive failed connection attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:54321/realtime/v1/websocket?vsn=1.0.0".to_string(),
            heartbeat_interval_secs: 25,
            reconnect_base_delay_secs: 1,
            reconnect_max_delay_secs: 30,
            max_reconnect_attempts: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn from_config(config: &Config) -> RealtimeResult<Self> {
        let url = config
            .realtime_url()
            .map_err(|e| RealtimeError::Config(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            heartbeat_interval_secs: config.realtime_heartbeat_secs,
            ..Default::default()
        })
    }

    /// Exponential backoff for the given 1-based attempt, capped.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay_secs
            .saturating_mul(2u64.pow(exponent))
            .min(self.reconnect_max_delay_secs);
        Duration::from_secs(delay)
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the realtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Socket connected; registered channels are being (re)joined.
    Connected,
    /// Socket dropped; a reconnect is scheduled.
    Disconnected(Option<String>),
    /// The server acknowledged a channel join.
    ChannelJoined(String),
    /// The server rejected or errored a channel.
    ChannelError { topic: String, reason: String },
    /// Reconnection gave up.
    GaveUp { attempts: u32 },
}

enum Command {
    Join {
        topic: String,
        filter: ChangeFilter,
        sink: mpsc::UnboundedSender<ChangeEvent>,
    },
    Leave {
        topic: String,
    },
    Shutdown,
}

/// Realtime channel client with automatic reconnection.
///
/// Subscriptions are registered with a background worker that owns the
/// socket. The worker joins each channel, re-joins all of them after a
/// reconnect, and routes `postgres_changes` frames to the subscription
/// that owns the topic.
pub struct RealtimeClient {
    config: RealtimeConfig,
    session: SessionHandle,
    state: Arc<RwLock<ConnectionState>>,
    commands: mpsc::UnboundedSender<Command>,
    pending_commands: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    event_tx: broadcast::Sender<RealtimeEvent>,
    next_topic: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Create a client. Nothing connects until [`RealtimeClient::connect`].
    pub fn new(config: RealtimeConfig, session: SessionHandle) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (commands, pending) = mpsc::unbounded_channel();

        Self {
            config,
            session,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            commands,
            pending_commands: Mutex::new(Some(pending)),
            event_tx,
            next_topic: AtomicU64::new(1),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to connection events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.event_tx.subscribe()
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Spawn the socket worker. Calling it again is a no-op.
    pub fn connect(&self) {
        let Some(commands) = self.pending_commands.lock().take() else {
            debug!("Realtime worker already started");
            return;
        };

        let worker = Worker {
            config: self.config.clone(),
            session: self.session.clone(),
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
            commands,
            channels: HashMap::new(),
            next_ref: 0,
            pending_heartbeat: None,
            last_token: None,
        };
        *self.task.lock() = Some(tokio::spawn(worker.run()));
    }

    /// Leave every channel, close the socket and stop the worker.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Realtime worker ended abnormally");
            }
        }
        // A worker that never started still owns the receiver here.
        self.pending_commands.lock().take();
        *self.state.write() = ConnectionState::Disconnected;
        info!("Realtime client shut down");
    }
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn subscribe(&self, filter: ChangeFilter) -> RealtimeResult<Subscription> {
        let id = self.next_topic.fetch_add(1, Ordering::SeqCst);
        let topic = format!("realtime:murmur-{}-{}", filter.table, id);
        let (sink, receiver) = mpsc::unbounded_channel();

        debug!(topic = %topic, filter = %filter.label(), "Registering channel");
        self.commands
            .send(Command::Join {
                topic: topic.clone(),
                filter,
                sink,
            })
            .map_err(|_| RealtimeError::Closed)?;

        let commands = self.commands.clone();
        let release_topic = topic.clone();
        Ok(Subscription::new(topic, receiver, move || {
            let _ = commands.send(Command::Leave {
                topic: release_topic,
            });
        }))
    }

    fn events(&self) -> Option<broadcast::Receiver<RealtimeEvent>> {
        Some(self.event_tx.subscribe())
    }
}

struct Channel {
    filter: ChangeFilter,
    sink: mpsc::UnboundedSender<ChangeEvent>,
    join_ref: Option<String>,
    joined: bool,
}

enum Exit {
    Shutdown,
    Dropped(Option<String>),
}

struct Worker {
    config: RealtimeConfig,
    session: SessionHandle,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: broadcast::Sender<RealtimeEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    channels: HashMap<String, Channel>,
    next_ref: u64,
    pending_heartbeat: Option<String>,
    last_token: Option<String>,
}

impl Worker {
    async fn run(mut self) {
        let mut attempts: u32 = 0;

        loop {
            *self.state.write() = ConnectionState::Connecting;
            info!(url = %redact(&self.config.url), "Connecting to realtime");

            match connect_async(self.config.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    attempts = 0;
                    *self.state.write() = ConnectionState::Connected;
                    info!(channels = self.channels.len(), "Realtime connected");
                    let _ = self.event_tx.send(RealtimeEvent::Connected);

                    match self.serve(ws_stream).await {
                        Exit::Shutdown => break,
                        Exit::Dropped(reason) => {
                            *self.state.write() = ConnectionState::Disconnected;
                            warn!(reason = ?reason, "Realtime connection dropped");
                            let _ = self.event_tx.send(RealtimeEvent::Disconnected(reason));
                        }
                    }
                }
                Err(e) => {
                    *self.state.write() = ConnectionState::Disconnected;
                    warn!(error = %e, "Realtime connect failed");
                }
            }

            attempts += 1;
            if attempts > self.config.max_reconnect_attempts {
                error!(attempts, "Max realtime reconnect attempts reached");
                let _ = self.event_tx.send(RealtimeEvent::GaveUp { attempts });
                break;
            }

            let delay = self.config.reconnect_delay(attempts);
            info!(
                attempt = attempts,
                delay_secs = delay.as_secs(),
                "Scheduling realtime reconnect"
            );
            if !self.wait_for_reconnect(delay).await {
                break;
            }
        }

        *self.state.write() = ConnectionState::Disconnected;
        self.channels.clear();
        debug!("Realtime worker stopped");
    }

    /// Keep bookkeeping commands flowing while backing off. Returns `false`
    /// on shutdown.
    async fn wait_for_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return false,
                    Some(Command::Join { topic, filter, sink }) => {
                        self.channels.insert(
                            topic,
                            Channel {
                                filter,
                                sink,
                                join_ref: None,
                                joined: false,
                            },
                        );
                    }
                    Some(Command::Leave { topic }) => {
                        self.channels.remove(&topic);
                    }
                },
            }
        }
    }

    fn take_ref(&mut self) -> u64 {
        self.next_ref += 1;
        self.next_ref
    }

    async fn send(write: &mut WsSink, msg: &PhoenixMessage) -> Result<(), Exit> {
        let json = msg
            .to_json()
            .map_err(|e| Exit::Dropped(Some(format!("encode failed: {e}"))))?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| Exit::Dropped(Some(e.to_string())))
    }

    async fn join_channel(&mut self, write: &mut WsSink, topic: &str) -> Result<(), Exit> {
        let msg_ref = self.take_ref();
        let token = self.session.access_token();
        let Some(channel) = self.channels.get_mut(topic) else {
            return Ok(());
        };
        channel.join_ref = Some(msg_ref.to_string());
        channel.joined = false;
        let msg = PhoenixMessage::join(topic, &channel.filter, token.as_deref(), msg_ref);
        debug!(topic, filter = %channel.filter.label(), "Joining channel");
        Self::send(write, &msg).await
    }

    async fn leave_channel(&mut self, write: &mut WsSink, topic: &str) -> Result<(), Exit> {
        let msg_ref = self.take_ref();
        debug!(topic, "Leaving channel");
        Self::send(write, &PhoenixMessage::leave(topic, msg_ref)).await
    }

    async fn serve(&mut self, ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Exit {
        let (mut write, mut read) = ws_stream.split();
        self.pending_heartbeat = None;
        self.last_token = self.session.access_token();

        let topics: Vec<String> = self.channels.keys().cloned().collect();
        for topic in topics {
            if let Err(exit) = self.join_channel(&mut write, &topic).await {
                return exit;
            }
        }

        let mut heartbeat = interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            let step = tokio::select! {
                _ = heartbeat.tick() => self.on_heartbeat(&mut write).await,
                command = self.commands.recv() => self.on_command(&mut write, command).await,
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_frame(&mut write, &text).await,
                    Some(Ok(Message::Ping(data))) => write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| Exit::Dropped(Some(e.to_string()))),
                    Some(Ok(Message::Close(frame))) => {
                        info!("Realtime connection closed by server");
                        Err(Exit::Dropped(frame.map(|f| f.reason.to_string())))
                    }
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        Err(Exit::Dropped(Some(e.to_string())))
                    }
                    None => Err(Exit::Dropped(None)),
                },
            };

            if let Err(exit) = step {
                if matches!(exit, Exit::Shutdown) {
                    let _ = write.close().await;
                }
                return exit;
            }
        }
    }

    async fn on_heartbeat(&mut self, write: &mut WsSink) -> Result<(), Exit> {
        if self.pending_heartbeat.is_some() {
            return Err(Exit::Dropped(Some("heartbeat timed out".to_string())));
        }
        let msg_ref = self.take_ref();
        self.pending_heartbeat = Some(msg_ref.to_string());
        Self::send(write, &PhoenixMessage::heartbeat(msg_ref)).await?;

        let token = self.session.access_token();
        if token.is_some() && token != self.last_token {
            self.last_token = token.clone();
            let token = token.unwrap_or_default();
            let topics: Vec<String> = self
                .channels
                .iter()
                .filter(|(_, channel)| channel.joined)
                .map(|(topic, _)| topic.clone())
                .collect();
            debug!(channels = topics.len(), "Pushing refreshed access token");
            for topic in topics {
                let msg_ref = self.take_ref();
                Self::send(write, &PhoenixMessage::access_token(&topic, &token, msg_ref)).await?;
            }
        }
        Ok(())
    }

    async fn on_command(
        &mut self,
        write: &mut WsSink,
        command: Option<Command>,
    ) -> Result<(), Exit> {
        match command {
            None | Some(Command::Shutdown) => {
                let topics: Vec<String> = self.channels.keys().cloned().collect();
                for topic in topics {
                    let _ = self.leave_channel(write, &topic).await;
                }
                Err(Exit::Shutdown)
            }
            Some(Command::Join { topic, filter, sink }) => {
                self.channels.insert(
                    topic.clone(),
                    Channel {
                        filter,
                        sink,
                        join_ref: None,
                        joined: false,
                    },
                );
                self.join_channel(write, &topic).await
            }
            Some(Command::Leave { topic }) => {
                if self.channels.remove(&topic).is_some() {
                    self.leave_channel(write, &topic).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn on_frame(&mut self, write: &mut WsSink, text: &str) -> Result<(), Exit> {
        let msg = match PhoenixMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Failed to parse realtime frame");
                return Ok(());
            }
        };

        if msg.topic == PHOENIX_TOPIC {
            if msg.event == events::REPLY && msg.msg_ref == self.pending_heartbeat {
                self.pending_heartbeat = None;
            }
            return Ok(());
        }

        match msg.event.as_str() {
            events::POSTGRES_CHANGES => {
                let Some(change) = msg.change_event() else {
                    warn!(topic = %msg.topic, "Undecodable change payload");
                    return Ok(());
                };
                let delivered = self
                    .channels
                    .get(&msg.topic)
                    .map(|channel| channel.sink.send(change).is_ok());
                if delivered == Some(false) {
                    debug!(topic = %msg.topic, "Subscriber gone, leaving channel");
                    self.channels.remove(&msg.topic);
                    self.leave_channel(write, &msg.topic).await?;
                }
                Ok(())
            }
            events::REPLY => {
                let Some(channel) = self.channels.get_mut(&msg.topic) else {
                    return Ok(());
                };
                if channel.join_ref.is_none() || channel.join_ref != msg.msg_ref {
                    return Ok(());
                }
                if msg.reply_ok() == Some(true) {
                    channel.joined = true;
                    info!(topic = %msg.topic, "Channel joined");
                    let _ = self
                        .event_tx
                        .send(RealtimeEvent::ChannelJoined(msg.topic.clone()));
                } else {
                    let reason = msg.reason().unwrap_or_else(|| "join rejected".to_string());
                    warn!(topic = %msg.topic, reason = %reason, "Channel join rejected");
                    let _ = self.event_tx.send(RealtimeEvent::ChannelError {
                        topic: msg.topic.clone(),
                        reason,
                    });
                }
                Ok(())
            }
            events::ERROR => {
                warn!(topic = %msg.topic, "Channel errored, re-joining");
                let _ = self.event_tx.send(RealtimeEvent::ChannelError {
                    topic: msg.topic.clone(),
                    reason: msg.reason().unwrap_or_else(|| "channel error".to_string()),
                });
                self.join_channel(write, &msg.topic).await
            }
            events::CLOSE => {
                if let Some(channel) = self.channels.get_mut(&msg.topic) {
                    channel.joined = false;
                }
                debug!(topic = %msg.topic, "Channel closed");
                Ok(())
            }
            events::SYSTEM => {
                let status = msg.payload.get("status").and_then(|s| s.as_str());
                if status == Some("error") {
                    let reason = msg.reason().unwrap_or_else(|| "system error".to_string());
                    warn!(topic = %msg.topic, reason = %reason, "Realtime system error");
                    let _ = self.event_tx.send(RealtimeEvent::ChannelError {
                        topic: msg.topic.clone(),
                        reason,
                    });
                } else {
                    debug!(topic = %msg.topic, "Realtime system message");
                }
                Ok(())
            }
            other => {
                debug!(topic = %msg.topic, event = other, "Ignoring realtime event");
                Ok(())
            }
        }
    }
}

/// Strip the query string (it carries the api key) before logging.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_config_and_utils::AuthContext;
    use serde_json::json;

    #[test]
    fn test_realtime_config_default() {
        let config = RealtimeConfig::default();
        assert_eq!(config.heartbeat_interval_secs, 25);
        assert_eq!(config.reconnect_base_delay_secs, 1);
        assert_eq!(config.reconnect_max_delay_secs, 30);
        assert_eq!(config.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_reconnect_delay_backs_off_and_caps() {
        let config = RealtimeConfig {
            reconnect_base_delay_secs: 2,
            reconnect_max_delay_secs: 30,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(config.reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(config.reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_from_config_uses_socket_url() {
        let mut config = Config::default();
        config.supabase_url = "https://abc.supabase.co".to_string();
        config.realtime_heartbeat_secs = 15;

        let realtime = RealtimeConfig::from_config(&config).unwrap();
        assert!(realtime.url.starts_with("wss://abc.supabase.co/realtime/v1/websocket?"));
        assert_eq!(realtime.heartbeat_interval_secs, 15);
    }

    #[test]
    fn test_redact_drops_query() {
        assert_eq!(
            redact("wss://abc.supabase.co/realtime/v1/websocket?apikey=secret"),
            "wss://abc.supabase.co/realtime/v1/websocket"
        );
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = RealtimeClient::new(RealtimeConfig::default(), SessionHandle::new());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_buffered() {
        let client = RealtimeClient::new(RealtimeConfig::default(), SessionHandle::new());
        let sub = client
            .subscribe(ChangeFilter::table("room_participants").eq("room_id", "r1"))
            .await
            .unwrap();
        assert!(sub.topic().starts_with("realtime:murmur-room_participants-"));
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_fails() {
        let client = RealtimeClient::new(RealtimeConfig::default(), SessionHandle::new());
        client.shutdown().await;

        let err = client
            .subscribe(ChangeFilter::table("audio_rooms"))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Closed));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let config = RealtimeConfig {
            url: "ws://127.0.0.1:9/realtime/v1/websocket".to_string(),
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        let session = SessionHandle::signed_in(AuthContext::new("u1", "token"));
        let client = RealtimeClient::new(config, session);
        let mut events = client.subscribe_events();
        client.connect();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, RealtimeEvent::GaveUp { attempts: 1 });
    }

    #[test]
    fn test_change_payload_routes_by_topic() {
        let frame = json!({
            "topic": "realtime:murmur-audio_rooms-1",
            "event": "postgres_changes",
            "payload": {
                "data": { "table": "audio_rooms", "type": "DELETE", "old_record": { "id": "r1" } }
            },
            "ref": null
        })
        .to_string();
        let msg = PhoenixMessage::from_json(&frame).unwrap();
        assert_eq!(msg.topic, "realtime:murmur-audio_rooms-1");
        let change = msg.change_event().unwrap();
        assert!(change.new_row.is_none());
        assert_eq!(change.old_row.unwrap()["id"], "r1");
    }
}
