//! Realtime push channel.
//!
//! One management task per channel owns the transport. After every open it
//! sends the authentication handshake, then feeds pushed notifications into the
//! [`NotificationStore`]. Abnormal closures are retried with capped exponential
//! backoff until the attempt budget runs out; a clean close or
//! [`disconnect`](NotificationChannel::disconnect) ends the task for good.
//!
//! ```text
//! Disconnected → Connecting → AwaitingHandshakeAck → Open
//!                    ▲                                 │ abnormal close
//!                    └──────── Backoff{attempt} ◀──────┘
//!                                    │ budget spent
//!                                    ▼
//!                                 GivenUp
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::backoff::ReconnectState;
use super::envelope::{ClientMessage, PushEnvelope};
use super::model::Notification;
use super::store::NotificationStore;
use super::transport::{Incoming, PushConnection, PushTransport, WsTransport};
use crate::config::ClientConfig;
use crate::credentials::{SessionEvent, SessionManager};
use crate::error::{ClientError, Result};

/// Upper bound on waiting for the task to finish its clean close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    AwaitingHandshakeAck,
    Open,
    /// Waiting `delay` before reconnection attempt number `attempt`.
    Backoff { attempt: u32, delay: Duration },
    /// Attempt budget exhausted; no further reconnection.
    GivenUp,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Notification(Notification),
    /// The channel gave up after `attempts` failed reconnections.
    Offline { attempts: u32 },
}

/// Why one connection ended.
enum End {
    /// Server sent a close frame.
    Clean,
    Cancelled,
    /// The session is gone; nothing to authenticate with.
    LoggedOut,
    Abnormal(ClientError),
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    config: Arc<ClientConfig>,
    session: Arc<SessionManager>,
    store: Arc<NotificationStore>,
    transport: Arc<dyn PushTransport>,
    state_tx: watch::Sender<ChannelState>,
    event_tx: broadcast::Sender<ChannelEvent>,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            debug!(?state, "Channel state changed");
            let _ = self.event_tx.send(ChannelEvent::StateChanged(state));
        }
    }
}

pub struct NotificationChannel {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl NotificationChannel {
    /// Channel over WebSocket.
    pub fn new(
        config: Arc<ClientConfig>,
        session: Arc<SessionManager>,
        store: Arc<NotificationStore>,
    ) -> Self {
        Self::with_transport(config, session, store, Arc::new(WsTransport))
    }

    pub fn with_transport(
        config: Arc<ClientConfig>,
        session: Arc<SessionManager>,
        store: Arc<NotificationStore>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                session,
                store,
                transport,
                state_tx,
                event_tx,
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the management task. No-op while it is already running.
    ///
    /// Starting again after the channel gave up begins a fresh attempt budget.
    pub fn connect(&self) -> Result<()> {
        if self.shared.session.user_id().is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        let url = self.shared.config.push_endpoint()?;

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Channel already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&self.shared), url, cancel.clone()));
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Close the transport cleanly and cancel any pending reconnection. Idempotent.
    pub async fn disconnect(&self) {
        let running = self.running.lock().take();
        if let Some(Running { cancel, mut handle }) = running {
            cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Channel task did not stop in time; aborting");
                handle.abort();
            }
        }
        self.shared.set_state(ChannelState::Disconnected);
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn run(shared: Arc<Shared>, url: String, cancel: CancellationToken) {
    let mut reconnect = ReconnectState::new(shared.config.reconnect);
    let mut session_events = shared.session.subscribe();

    loop {
        let end = connect_once(&shared, &url, &mut reconnect, &mut session_events, &cancel).await;
        let reason = match end {
            End::Clean => {
                info!("Push channel closed by server");
                break;
            }
            End::Cancelled => break,
            End::LoggedOut => {
                info!("Session ended; closing push channel");
                break;
            }
            End::Abnormal(reason) => reason,
        };

        let Some(delay) = reconnect.on_abnormal_close() else {
            let attempts = reconnect.attempt() - 1;
            error!(attempts, error = %reason, "Push channel unreachable; giving up");
            shared.set_state(ChannelState::GivenUp);
            let _ = shared.event_tx.send(ChannelEvent::Offline { attempts });
            return;
        };

        warn!(
            attempt = reconnect.attempt(),
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Push channel dropped; reconnecting"
        );
        shared.set_state(ChannelState::Backoff {
            attempt: reconnect.attempt(),
            delay,
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ChannelState::Disconnected);
    debug!("Push channel task stopped");
}

/// Drive one connection from open to close.
async fn connect_once(
    shared: &Shared,
    url: &str,
    reconnect: &mut ReconnectState,
    session_events: &mut broadcast::Receiver<SessionEvent>,
    cancel: &CancellationToken,
) -> End {
    let handshake_timeout = shared.config.handshake_timeout();

    let Some(handshake) = handshake_message(&shared.session).await else {
        return End::LoggedOut;
    };

    shared.set_state(ChannelState::Connecting);
    info!(%url, "Connecting push channel");

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => return End::Cancelled,
        res = tokio::time::timeout(handshake_timeout, shared.transport.connect(url)) => res,
    };
    let mut conn = match connected {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return End::Abnormal(e),
        Err(_) => return End::Abnormal(ClientError::Timeout),
    };

    shared.set_state(ChannelState::AwaitingHandshakeAck);
    if let Err(e) = conn.send_text(handshake).await {
        return End::Abnormal(e);
    }

    let deadline = tokio::time::sleep(handshake_timeout);
    tokio::pin!(deadline);
    let mut heartbeat = shared.config.heartbeat_interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    let mut open = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = conn.close().await;
                return End::Cancelled;
            }

            _ = &mut deadline, if !open => {
                warn!("Handshake not acknowledged in time");
                let _ = conn.close().await;
                return End::Abnormal(ClientError::Timeout);
            }

            event = session_events.recv() => match event {
                Ok(SessionEvent::Renewed | SessionEvent::LoggedIn { .. }) => {
                    let Some(handshake) = handshake_message(&shared.session).await else {
                        let _ = conn.close().await;
                        return End::LoggedOut;
                    };
                    debug!("Re-authenticating push channel");
                    if let Err(e) = conn.send_text(handshake).await {
                        return End::Abnormal(e);
                    }
                }
                Ok(SessionEvent::LoggedOut | SessionEvent::ForcedLogout { .. })
                | Err(RecvError::Closed) => {
                    let _ = conn.close().await;
                    return End::LoggedOut;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session events lagged");
                }
            },

            _ = tick(&mut heartbeat), if open && heartbeat.is_some() => {
                if let Err(e) = conn.ping().await {
                    return End::Abnormal(e);
                }
                trace!("Sent heartbeat");
            }

            frame = conn.next() => match frame {
                None => {
                    return End::Abnormal(ClientError::ChannelDropped(
                        "stream ended without close frame".to_string(),
                    ));
                }
                Some(Err(e)) => return End::Abnormal(e),
                Some(Ok(Incoming::Close(reason))) => {
                    debug!(?reason, "Close frame received");
                    return End::Clean;
                }
                Some(Ok(Incoming::Other)) => {}
                Some(Ok(Incoming::Text(text))) => match PushEnvelope::decode(&text) {
                    Ok(PushEnvelope::Error { message }) if !open => {
                        warn!(%message, "Handshake rejected");
                        let _ = conn.close().await;
                        return End::Abnormal(ClientError::websocket(format!(
                            "handshake rejected: {message}"
                        )));
                    }
                    Ok(envelope) => {
                        if !open {
                            open = true;
                            reconnect.reset();
                            shared.set_state(ChannelState::Open);
                            info!("Push channel open");
                        }
                        dispatch(shared, envelope);
                    }
                    Err(e) => warn!(error = %e, "Dropping push message"),
                },
            },
        }
    }
}

fn dispatch(shared: &Shared, envelope: PushEnvelope) {
    match envelope {
        PushEnvelope::Notification { payload } => {
            debug!(id = payload.id, kind = %payload.source_type, "Notification pushed");
            shared.store.receive_push(payload.clone());
            let _ = shared.event_tx.send(ChannelEvent::Notification(payload));
        }
        PushEnvelope::Ack => debug!("Handshake acknowledged"),
        PushEnvelope::Error { message } => warn!(%message, "Server reported an error"),
        PushEnvelope::Ping => trace!("Server ping"),
    }
}

async fn handshake_message(session: &SessionManager) -> Option<String> {
    let user_id = session.user_id()?;
    let token = session.current_access_credential().await?;
    match ClientMessage::authenticate(user_id, token).encode() {
        Ok(text) => Some(text),
        Err(e) => {
            error!(error = %e, "Failed to encode handshake");
            None
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
