//! Per-shard connection task.
//!
//! Each shard runs as an independent task owning its WebSocket connection and
//! session identity (session id, resume URL, last-seen sequence). The manager
//! talks to it over a command channel and hears back over a shared event
//! channel; the shard never touches manager state directly.

use crate::compression::Decompressor;
use crate::config::GatewayConfig;
use crate::error::Error;
use crate::handler::{DispatchEvent, GatewayHandler};
use crate::metrics::Metrics;
use crate::protocol::{self, close_policy, opcodes, ClosePolicy, GatewayPayload, Hello, ReadyData};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection status of a single shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStatus {
    /// No connection and no pending handshake
    #[default]
    Disconnected,
    /// Admitted for connect; socket and handshake in progress
    Connecting,
    /// Connected and replaying a previous session
    Resuming,
    /// Identify sent, waiting for the session to be acknowledged
    PreReady,
    /// Session established and heartbeating
    Ready,
}

impl ShardStatus {
    /// Whether the shard holds its concurrency bucket (connect admitted but
    /// session not yet established).
    pub fn is_mid_connect(self) -> bool {
        matches!(
            self,
            ShardStatus::Connecting | ShardStatus::Resuming | ShardStatus::PreReady
        )
    }
}

/// Commands the manager sends to a shard task.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ShardCommand {
    /// Permission to open a connection (granted by the connect queue)
    Connect,
    /// Tear down the connection; optionally requeue for reconnection
    Disconnect { reconnect: bool },
}

/// Lifecycle notifications a shard task sends back to the manager.
#[derive(Debug)]
pub(crate) enum ShardEvent {
    /// Resume payload sent, replay in progress
    Resuming { id: u16 },
    /// Identify sent, waiting for acknowledgement
    PreReady { id: u16 },
    /// Session established via identify
    Ready { id: u16 },
    /// Session re-established via resume
    Resumed { id: u16 },
    /// Connection ended; `error` is `None` for requested disconnects and
    /// `resumable` reports whether a session identity survived
    Disconnected {
        id: u16,
        error: Option<String>,
        resumable: bool,
    },
    /// Shard wants a (re)connect slot from the queue
    ConnectRequest { id: u16, resume: bool },
}

/// Why a session ended, and what the reconnection policy should do about it.
enum SessionEnd {
    /// Requested disconnect; stay idle
    Stop,
    /// Requested disconnect with immediate requeue
    Requested { resume: bool },
    /// Transport or protocol failure; retry per policy
    Failed { error: Error, resume: bool },
    /// Close code that forbids reconnection
    Fatal(Error),
}

/// What to do after a session ended and its outcome was reported.
enum AfterSession {
    Idle,
    IdleCleared,
    ConnectNow,
}

/// Session identity that survives across connections of one shard.
#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    resume_url: Option<String>,
    sequence: Option<u64>,
    handshake_complete: bool,
}

impl SessionState {
    fn clear(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.sequence = None;
    }
}

/// Borrowed context threaded through one session's lifetime.
struct SessionCtx<'a, H> {
    id: u16,
    total_shards: u16,
    config: &'a GatewayConfig,
    handler: &'a H,
    metrics: &'a Metrics,
    events: &'a mpsc::UnboundedSender<ShardEvent>,
}

enum FrameOutcome {
    Payload(GatewayPayload),
    Skip,
    End(SessionEnd),
}

/// The task driving one shard's connection lifecycle.
pub(crate) struct ShardRunner<H> {
    id: u16,
    total_shards: u16,
    gateway_url: String,
    config: Arc<GatewayConfig>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
    events: mpsc::UnboundedSender<ShardEvent>,
    session_id: Option<String>,
    resume_url: Option<String>,
    sequence: Option<u64>,
    resume_attempts: u32,
    reconnect_attempts: u32,
    last_delay: Duration,
}

impl<H: GatewayHandler> ShardRunner<H> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u16,
        total_shards: u16,
        gateway_url: String,
        config: Arc<GatewayConfig>,
        handler: Arc<H>,
        metrics: Arc<Metrics>,
        commands: mpsc::UnboundedReceiver<ShardCommand>,
        events: mpsc::UnboundedSender<ShardEvent>,
    ) -> Self {
        Self {
            id,
            total_shards,
            gateway_url,
            config,
            handler,
            metrics,
            commands,
            events,
            session_id: None,
            resume_url: None,
            sequence: None,
            resume_attempts: 0,
            reconnect_attempts: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Task entry point: idle until granted a connect slot, then run sessions
    /// until told to stop or the manager goes away.
    pub(crate) async fn run(mut self) {
        debug!("[SHARD-{}] task started", self.id);
        while let Some(command) = self.commands.recv().await {
            match command {
                ShardCommand::Disconnect { .. } => continue,
                ShardCommand::Connect => {}
            }
            loop {
                let end = self.run_session().await;
                match self.after_session(end).await {
                    AfterSession::ConnectNow => continue,
                    AfterSession::IdleCleared => {
                        self.session_id = None;
                        self.resume_url = None;
                        self.sequence = None;
                        break;
                    }
                    AfterSession::Idle => break,
                }
            }
        }
        debug!("[SHARD-{}] task stopped", self.id);
    }

    async fn run_session(&mut self) -> SessionEnd {
        let can_resume = self.session_id.is_some() && self.sequence.is_some();
        let url = self.connect_url(can_resume);
        let mut sess = SessionState {
            session_id: self.session_id.take(),
            resume_url: self.resume_url.take(),
            sequence: self.sequence.take(),
            handshake_complete: false,
        };
        let ctx = SessionCtx {
            id: self.id,
            total_shards: self.total_shards,
            config: &self.config,
            handler: &*self.handler,
            metrics: &self.metrics,
            events: &self.events,
        };
        let end = Self::drive_session(ctx, &mut self.commands, &url, &mut sess).await;

        self.session_id = sess.session_id.take();
        self.resume_url = sess.resume_url.take();
        self.sequence = sess.sequence.take();
        if sess.handshake_complete {
            self.resume_attempts = 0;
            self.reconnect_attempts = 0;
            self.last_delay = Duration::ZERO;
        }
        end
    }

    /// One connection: socket, hello, identify/resume, then the steady-state
    /// read/heartbeat loop. The handshake deadline covers everything from the
    /// socket open through the READY/RESUMED acknowledgement.
    async fn drive_session(
        ctx: SessionCtx<'_, H>,
        commands: &mut mpsc::UnboundedReceiver<ShardCommand>,
        url: &str,
        sess: &mut SessionState,
    ) -> SessionEnd {
        let id = ctx.id;
        let resuming = sess.session_id.is_some() && sess.sequence.is_some();
        let deadline = Instant::now() + ctx.config.connect_timeout;

        debug!("[SHARD-{id}] connecting to {url}");
        let ws = match timeout_at(deadline, open_socket(url)).await {
            Err(_) => {
                return SessionEnd::Failed {
                    error: Error::ConnectionTimeout,
                    resume: resuming,
                }
            }
            Ok(Err(e)) => {
                return SessionEnd::Failed {
                    error: e,
                    resume: resuming,
                }
            }
            Ok(Ok(ws)) => ws,
        };
        let (mut write, mut read) = ws.split();
        let mut decompressor = Decompressor::new(ctx.config.compress);

        // Wait for the server's hello before anything else.
        let hello: Hello = loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    return SessionEnd::Failed { error: Error::ConnectionTimeout, resume: resuming };
                }
                command = commands.recv() => match command {
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Stop;
                    }
                    Some(ShardCommand::Disconnect { reconnect }) => {
                        let _ = write.send(Message::Close(None)).await;
                        if reconnect {
                            return SessionEnd::Requested { resume: sess.session_id.is_some() };
                        }
                        sess.clear();
                        return SessionEnd::Stop;
                    }
                    Some(ShardCommand::Connect) => {}
                },
                frame = read.next() => {
                    let payload = match classify_frame(id, &mut decompressor, sess, ctx.metrics, frame) {
                        FrameOutcome::Payload(p) => p,
                        FrameOutcome::Skip => continue,
                        FrameOutcome::End(end) => return end,
                    };
                    if payload.op == opcodes::HELLO {
                        match serde_json::from_value::<Hello>(payload.d) {
                            Ok(hello) => break hello,
                            Err(e) => {
                                warn!("[SHARD-{id}] malformed hello payload: {e}");
                                continue;
                            }
                        }
                    }
                    debug!("[SHARD-{id}] dropping pre-hello frame (op {})", payload.op);
                }
            }
        };

        // Interval of zero would make the timer spin; clamp to 1ms.
        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        debug!("[SHARD-{id}] hello received, heartbeat interval {interval:?}");
        // First beat lands at a random fraction of the interval so shards
        // sharing a process do not heartbeat in lockstep.
        let first_beat = Instant::now() + interval.mul_f64(rand::random::<f64>());
        let mut heartbeat = interval_at(first_beat, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut acked = true;
        let mut last_beat = Instant::now();

        if resuming {
            let session_id = sess.session_id.clone().unwrap_or_default();
            let sequence = sess.sequence.unwrap_or(0);
            let payload = protocol::resume(&ctx.config.token, &session_id, sequence);
            if let Err(e) = send_payload(&mut write, &payload).await {
                return SessionEnd::Failed {
                    error: e,
                    resume: true,
                };
            }
            let _ = ctx.events.send(ShardEvent::Resuming { id });
            debug!("[SHARD-{id}] resuming session from sequence {sequence}");
        } else {
            let payload = protocol::identify(ctx.config, id, ctx.total_shards);
            if let Err(e) = send_payload(&mut write, &payload).await {
                return SessionEnd::Failed {
                    error: e,
                    resume: false,
                };
            }
            let _ = ctx.events.send(ShardEvent::PreReady { id });
            debug!("[SHARD-{id}] identify sent");
        }

        loop {
            tokio::select! {
                _ = sleep_until(deadline), if !sess.handshake_complete => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Failed { error: Error::ConnectionTimeout, resume: resuming };
                }
                _ = heartbeat.tick() => {
                    if !acked {
                        warn!("[SHARD-{id}] heartbeat not acknowledged, dropping connection");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Failed { error: Error::HeartbeatStalled, resume: true };
                    }
                    let payload = protocol::heartbeat(sess.sequence);
                    if let Err(e) = send_payload(&mut write, &payload).await {
                        return SessionEnd::Failed { error: e, resume: sess.session_id.is_some() };
                    }
                    acked = false;
                    last_beat = Instant::now();
                    ctx.metrics.record_heartbeat_sent();
                }
                command = commands.recv() => match command {
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Stop;
                    }
                    Some(ShardCommand::Disconnect { reconnect }) => {
                        debug!("[SHARD-{id}] disconnect requested (reconnect: {reconnect})");
                        let _ = write.send(Message::Close(None)).await;
                        if reconnect {
                            return SessionEnd::Requested { resume: sess.session_id.is_some() };
                        }
                        sess.clear();
                        return SessionEnd::Stop;
                    }
                    Some(ShardCommand::Connect) => {}
                },
                frame = read.next() => {
                    let payload = match classify_frame(id, &mut decompressor, sess, ctx.metrics, frame) {
                        FrameOutcome::Payload(p) => p,
                        FrameOutcome::Skip => continue,
                        FrameOutcome::End(end) => return end,
                    };
                    if let Some(s) = payload.s {
                        sess.sequence = Some(s);
                    }
                    match payload.op {
                        opcodes::DISPATCH => {
                            ctx.metrics.record_dispatch();
                            let name = payload.t.clone().unwrap_or_default();
                            match name.as_str() {
                                "READY" => match serde_json::from_value::<ReadyData>(payload.d.clone()) {
                                    Ok(ready) => {
                                        sess.session_id = Some(ready.session_id);
                                        sess.resume_url = ready.resume_gateway_url;
                                        sess.handshake_complete = true;
                                        ctx.metrics.record_connect();
                                        ctx.metrics.update_shard(id, |s| {
                                            s.is_ready = true;
                                            s.last_connected_at = Some(std::time::Instant::now());
                                            s.resume_attempt = 0;
                                            s.reconnect_attempt = 0;
                                        });
                                        let _ = ctx.events.send(ShardEvent::Ready { id });
                                        info!("[SHARD-{id}] ready");
                                    }
                                    Err(e) => warn!("[SHARD-{id}] malformed READY payload: {e}"),
                                },
                                "RESUMED" => {
                                    sess.handshake_complete = true;
                                    ctx.metrics.record_connect();
                                    ctx.metrics.record_resume();
                                    ctx.metrics.update_shard(id, |s| {
                                        s.is_ready = true;
                                        s.last_connected_at = Some(std::time::Instant::now());
                                        s.resume_attempt = 0;
                                        s.reconnect_attempt = 0;
                                    });
                                    let _ = ctx.events.send(ShardEvent::Resumed { id });
                                    info!("[SHARD-{id}] session resumed");
                                }
                                _ => {}
                            }
                            ctx.handler
                                .on_dispatch(id, DispatchEvent {
                                    name,
                                    data: payload.d,
                                    sequence: payload.s,
                                })
                                .await;
                        }
                        opcodes::HEARTBEAT => {
                            // Server demands an immediate beat outside the timer.
                            let hb = protocol::heartbeat(sess.sequence);
                            if let Err(e) = send_payload(&mut write, &hb).await {
                                return SessionEnd::Failed { error: e, resume: sess.session_id.is_some() };
                            }
                            ctx.metrics.record_heartbeat_sent();
                        }
                        opcodes::HEARTBEAT_ACK => {
                            acked = true;
                            let latency = last_beat.elapsed();
                            ctx.metrics.record_heartbeat_ack();
                            ctx.metrics.update_shard(id, |s| s.latency = Some(latency));
                        }
                        opcodes::RECONNECT => {
                            debug!("[SHARD-{id}] server requested reconnect");
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Failed {
                                error: Error::ConnectionFailed("server requested reconnect".to_string()),
                                resume: sess.session_id.is_some(),
                            };
                        }
                        opcodes::INVALID_SESSION => {
                            ctx.metrics.record_invalid_session();
                            let resumable = payload.d.as_bool().unwrap_or(false);
                            warn!("[SHARD-{id}] session invalidated (resumable: {resumable})");
                            if !resumable {
                                sess.clear();
                            }
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Failed {
                                error: Error::ConnectionFailed("session invalidated by server".to_string()),
                                resume: resumable,
                            };
                        }
                        opcodes::HELLO => {}
                        op => debug!("[SHARD-{id}] unhandled opcode {op}"),
                    }
                }
            }
        }
    }

    /// Report the session outcome and decide whether to retry, and how.
    async fn after_session(&mut self, end: SessionEnd) -> AfterSession {
        let id = self.id;
        let resumable = self.session_id.is_some() && self.sequence.is_some();
        self.metrics.update_shard(id, |s| {
            s.is_ready = false;
            if let Some(connected_at) = s.last_connected_at.take() {
                s.total_uptime += connected_at.elapsed();
            }
        });

        match end {
            SessionEnd::Stop => {
                let _ = self.events.send(ShardEvent::Disconnected {
                    id,
                    error: None,
                    resumable,
                });
                AfterSession::Idle
            }
            SessionEnd::Requested { resume } => {
                let _ = self.events.send(ShardEvent::Disconnected {
                    id,
                    error: None,
                    resumable,
                });
                let _ = self.events.send(ShardEvent::ConnectRequest { id, resume });
                AfterSession::Idle
            }
            SessionEnd::Fatal(e) => {
                error!("[SHARD-{id}] {e}");
                self.metrics.record_error();
                let _ = self.events.send(ShardEvent::Disconnected {
                    id,
                    error: Some(e.to_string()),
                    resumable,
                });
                AfterSession::Idle
            }
            SessionEnd::Failed { error, resume } => {
                warn!("[SHARD-{id}] connection ended: {error}");
                self.metrics.record_error();
                let _ = self.events.send(ShardEvent::Disconnected {
                    id,
                    error: Some(error.to_string()),
                    resumable,
                });
                if !self.config.auto_reconnect {
                    return AfterSession::Idle;
                }
                self.backoff_and_request(resume).await
            }
        }
    }

    /// Sleep out the backoff delay, then ask the manager for a connect slot.
    /// A disconnect command received during the sleep cancels the retry.
    async fn backoff_and_request(&mut self, resume_preferred: bool) -> AfterSession {
        let id = self.id;
        let mut resume =
            resume_preferred && self.session_id.is_some() && self.sequence.is_some();

        if resume && self.resume_attempts >= self.config.max_resume_attempts {
            warn!(
                "[SHARD-{id}] resume budget exhausted after {} attempts, falling back to a fresh identify",
                self.resume_attempts
            );
            self.session_id = None;
            self.resume_url = None;
            self.sequence = None;
            self.resume_attempts = 0;
            resume = false;
        }
        if !resume {
            if let Some(max) = self.config.max_reconnect_attempts {
                if self.reconnect_attempts >= max {
                    error!(
                        "[SHARD-{id}] {}",
                        Error::AttemptsExhausted {
                            kind: "reconnect",
                            attempts: self.reconnect_attempts,
                        }
                    );
                    return AfterSession::Idle;
                }
            }
        }

        let attempts = if resume {
            self.resume_attempts
        } else {
            self.reconnect_attempts
        };
        let delay = (self.config.reconnect_delay)(self.last_delay, attempts);
        self.last_delay = delay;
        if resume {
            self.resume_attempts += 1;
        } else {
            self.reconnect_attempts += 1;
        }
        self.metrics.record_reconnect();
        let (resume_attempt, reconnect_attempt) = (self.resume_attempts, self.reconnect_attempts);
        self.metrics.update_shard(id, move |s| {
            s.resume_attempt = resume_attempt;
            s.reconnect_attempt = reconnect_attempt;
        });
        debug!(
            "[SHARD-{id}] retrying ({}) in {delay:?}",
            if resume { "resume" } else { "identify" }
        );

        let events = self.events.clone();
        let commands = &mut self.commands;
        tokio::select! {
            _ = sleep(delay) => {
                let _ = events.send(ShardEvent::ConnectRequest { id, resume });
                AfterSession::Idle
            }
            command = commands.recv() => match command {
                None => AfterSession::Idle,
                Some(ShardCommand::Disconnect { reconnect: false }) => AfterSession::IdleCleared,
                Some(ShardCommand::Disconnect { reconnect: true }) => {
                    let _ = events.send(ShardEvent::ConnectRequest { id, resume });
                    AfterSession::Idle
                }
                Some(ShardCommand::Connect) => AfterSession::ConnectNow,
            },
        }
    }

    /// Pick the URL for the next connection. Resumes go to the session's
    /// resume URL (carrying over the negotiated query parameters) unless
    /// configured to reuse the connect URL.
    fn connect_url(&self, can_resume: bool) -> String {
        if can_resume && !self.config.resume_url_is_gateway_url() {
            if let Some(resume_url) = &self.resume_url {
                return resume_connect_url(resume_url, &self.gateway_url);
            }
        }
        self.gateway_url.clone()
    }
}

/// Join a session's resume URL with the query string negotiated on the
/// original connect URL.
fn resume_connect_url(resume_url: &str, gateway_url: &str) -> String {
    let query = gateway_url
        .find('?')
        .map(|i| &gateway_url[i..])
        .unwrap_or("");
    format!("{}/{}", resume_url.trim_end_matches('/'), query)
}

/// Sort one inbound frame into a payload, a no-op, or the end of the session.
fn classify_frame(
    id: u16,
    decompressor: &mut Decompressor,
    sess: &mut SessionState,
    metrics: &Metrics,
    frame: Option<Result<Message, WsError>>,
) -> FrameOutcome {
    let message = match frame {
        None => {
            return FrameOutcome::End(SessionEnd::Failed {
                error: Error::ConnectionFailed("stream ended unexpectedly".to_string()),
                resume: sess.session_id.is_some(),
            })
        }
        Some(Err(e)) => {
            return FrameOutcome::End(SessionEnd::Failed {
                error: e.into(),
                resume: sess.session_id.is_some(),
            })
        }
        Some(Ok(message)) => message,
    };

    let bytes: Vec<u8> = match message {
        Message::Text(text) => text.as_bytes().to_vec(),
        Message::Binary(bin) => match decompressor.decompress(&bin) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return FrameOutcome::Skip,
            Err(e) => {
                return FrameOutcome::End(SessionEnd::Failed {
                    error: e,
                    resume: sess.session_id.is_some(),
                })
            }
        },
        Message::Close(frame) => {
            let (code, reason) = frame
                .map(|f| (u16::from(f.code), f.reason.to_string()))
                .unwrap_or((1005, String::new()));
            debug!("[SHARD-{id}] server closed the connection: {code} {reason}");
            let end = match close_policy(code) {
                ClosePolicy::Fatal => {
                    sess.clear();
                    SessionEnd::Fatal(Error::FatalClose { code, reason })
                }
                ClosePolicy::Reidentify => {
                    sess.clear();
                    SessionEnd::Failed {
                        error: Error::ConnectionFailed(format!("closed with code {code}: {reason}")),
                        resume: false,
                    }
                }
                ClosePolicy::Resume => SessionEnd::Failed {
                    error: Error::ConnectionFailed(format!("closed with code {code}: {reason}")),
                    resume: sess.session_id.is_some(),
                },
            };
            return FrameOutcome::End(end);
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return FrameOutcome::Skip,
    };

    match serde_json::from_slice::<GatewayPayload>(&bytes) {
        Ok(payload) => FrameOutcome::Payload(payload),
        Err(e) => {
            warn!("[SHARD-{id}] dropping malformed payload: {e}");
            metrics.record_error();
            FrameOutcome::Skip
        }
    }
}

async fn send_payload(
    write: &mut (impl Sink<Message, Error = WsError> + Unpin),
    payload: &GatewayPayload,
) -> Result<(), Error> {
    let text = serde_json::to_string(payload)?;
    write.send(Message::text(text)).await?;
    Ok(())
}

/// Open the TCP socket ourselves so low-level options can be set before the
/// TLS and WebSocket handshakes run on top of it.
async fn open_socket(url: &str) -> Result<WsStream, Error> {
    let parsed =
        Url::parse(url).map_err(|e| Error::ConnectionFailed(format!("invalid gateway URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("gateway URL has no host".to_string()))?
        .to_string();
    let tls = parsed.scheme() == "wss";
    let port = parsed.port().unwrap_or(if tls { 443 } else { 80 });

    let addr = lookup_host((host.as_str(), port))
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup for {host} failed: {e}")))?
        .next()
        .ok_or_else(|| {
            Error::ConnectionFailed(format!("DNS lookup for {host} returned no addresses"))
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("socket creation failed: {e}")))?;
    let stream = socket
        .connect(addr)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("TCP connect to {addr} failed: {e}")))?;
    set_tcp_options(&stream);

    let connector = if tls {
        let tls_connector = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS initialization failed: {e}")))?;
        Some(Connector::NativeTls(tls_connector))
    } else {
        None
    };

    let request = url.into_client_request()?;
    let (ws, _response) = client_async_tls_with_config(request, stream, None, connector).await?;
    Ok(ws)
}

fn set_tcp_options(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {e}");
    }
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        debug!("failed to set TCP keepalive: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_url_carries_query() {
        let url = resume_connect_url(
            "wss://resume.gateway.test",
            "wss://gateway.test/?v=10&encoding=json&compress=zlib-stream",
        );
        assert_eq!(
            url,
            "wss://resume.gateway.test/?v=10&encoding=json&compress=zlib-stream"
        );
    }

    #[test]
    fn test_resume_url_without_query() {
        assert_eq!(
            resume_connect_url("wss://resume.gateway.test/", "wss://gateway.test"),
            "wss://resume.gateway.test/"
        );
    }

    #[test]
    fn test_mid_connect_statuses() {
        assert!(!ShardStatus::Disconnected.is_mid_connect());
        assert!(ShardStatus::Connecting.is_mid_connect());
        assert!(ShardStatus::Resuming.is_mid_connect());
        assert!(ShardStatus::PreReady.is_mid_connect());
        assert!(!ShardStatus::Ready.is_mid_connect());
    }
}
