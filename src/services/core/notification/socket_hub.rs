// In-app socket hub: tracks connected recipients, serializes frame writes
// per session, and holds frames for offline users until their next register.

use crate::services::core::notification::history_store::HistoryStore;
use crate::types::{NotificationStatus, SocketFrame};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};

/// Configuration for the socket hub.
#[derive(Debug, Clone)]
pub struct SocketHubConfig {
    pub heartbeat_interval_seconds: u64,
    /// Frames buffered per session writer before writes are treated as
    /// failures.
    pub session_buffer: usize,
    /// Offline frames held per user; oldest are dropped beyond this.
    pub max_pending_frames_per_user: usize,
    /// SENT records only upgrade to DELIVERED if the ack arrives within this
    /// window of the send attempt.
    pub ack_window_seconds: i64,
    /// When true, IN_APP dispatch to an offline user is cancelled instead of
    /// held pending.
    pub require_session: bool,
}

impl Default for SocketHubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            session_buffer: 32,
            max_pending_frames_per_user: 100,
            ack_window_seconds: 60,
            require_session: false,
        }
    }
}

impl SocketHubConfig {
    /// Read `IN_APP_REQUIRE_SESSION` and `SOCKET_HEARTBEAT_SECONDS`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("IN_APP_REQUIRE_SESSION") {
            config.require_session = matches!(raw.trim(), "1" | "true" | "TRUE" | "yes");
        }
        if let Ok(raw) = std::env::var("SOCKET_HEARTBEAT_SECONDS") {
            config.heartbeat_interval_seconds = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!(
                    "SOCKET_HEARTBEAT_SECONDS must be an integer: {}",
                    raw
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(NotifyError::config_error(
                "heartbeat_interval_seconds must be greater than 0",
            ));
        }
        if self.session_buffer == 0 || self.max_pending_frames_per_user == 0 {
            return Err(NotifyError::config_error(
                "socket buffers must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Sessions silent beyond twice the heartbeat interval are closed.
    pub fn session_timeout(&self) -> Duration {
        Duration::seconds((self.heartbeat_interval_seconds * 2) as i64)
    }
}

/// One connected device session. The mpsc sender is the sole write path, so
/// frames to a session are naturally serialized.
pub struct SessionEntry {
    pub session_id: String,
    pub user_id: String,
    pub is_admin: bool,
    sender: mpsc::Sender<SocketFrame>,
    last_heartbeat: Mutex<DateTime<Utc>>,
}

impl SessionEntry {
    fn touch(&self) {
        if let Ok(mut beat) = self.last_heartbeat.lock() {
            *beat = Utc::now();
        }
    }

    fn silent_since(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .map(|beat| Utc::now() - *beat)
            .unwrap_or_else(|_| Duration::zero())
    }
}

/// Outcome of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// At least one connected session accepted the frame.
    pub delivered_live: bool,
    /// The frame was parked for a future session.
    pub parked: bool,
}

/// Owns the userId -> sessions mapping (a user may have several devices) and
/// the per-user pending queues for offline delivery.
pub struct SocketHub {
    config: SocketHubConfig,
    sessions: RwLock<HashMap<String, Vec<Arc<SessionEntry>>>>,
    pending: RwLock<HashMap<String, VecDeque<SocketFrame>>>,
    history: Arc<HistoryStore>,
    logger: Logger,
}

impl SocketHub {
    pub fn new(config: SocketHubConfig, history: Arc<HistoryStore>) -> NotifyResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            history,
            logger: Logger::new(LogLevel::Info),
        })
    }

    pub fn require_session(&self) -> bool {
        self.config.require_session
    }

    /// Register a device session; the receiver side is handed to the socket
    /// layer. Pending frames for the user are flushed to the new session and
    /// their records upgraded to DELIVERED.
    pub async fn register(
        &self,
        user_id: &str,
        is_admin: bool,
    ) -> (Arc<SessionEntry>, mpsc::Receiver<SocketFrame>) {
        let (sender, receiver) = mpsc::channel(self.config.session_buffer);
        let entry = Arc::new(SessionEntry {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            is_admin,
            sender,
            last_heartbeat: Mutex::new(Utc::now()),
        });

        {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(user_id.to_string())
                .or_default()
                .push(Arc::clone(&entry));
        }
        self.logger.info(&format!(
            "session registered user={} session={}",
            user_id, entry.session_id
        ));

        self.flush_pending(user_id, &entry).await;
        (entry, receiver)
    }

    pub async fn unregister(&self, user_id: &str, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entries) = sessions.get_mut(user_id) {
            entries.retain(|entry| entry.session_id != session_id);
            if entries.is_empty() {
                sessions.remove(user_id);
            }
        }
        self.logger.info(&format!(
            "session unregistered user={} session={}",
            user_id, session_id
        ));
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.get(user_id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Write the frame to every session of the user. Sessions whose writer is
    /// gone are closed and removed. With no session left the frame is parked
    /// (unless `require_session` is set).
    pub async fn push(&self, user_id: &str, frame: SocketFrame) -> NotifyResult<PushOutcome> {
        let targets: Vec<Arc<SessionEntry>> = {
            let sessions = self.sessions.read().await;
            sessions.get(user_id).cloned().unwrap_or_default()
        };

        let mut delivered = false;
        let mut failed: Vec<String> = Vec::new();
        for entry in &targets {
            match entry.sender.try_send(frame.clone()) {
                Ok(()) => delivered = true,
                Err(_) => failed.push(entry.session_id.clone()),
            }
        }

        for session_id in &failed {
            self.unregister(user_id, session_id).await;
        }

        if delivered {
            return Ok(PushOutcome {
                delivered_live: true,
                parked: false,
            });
        }

        if self.config.require_session {
            return Ok(PushOutcome {
                delivered_live: false,
                parked: false,
            });
        }

        self.park(user_id, frame).await;
        Ok(PushOutcome {
            delivered_live: false,
            parked: true,
        })
    }

    /// Broadcast a system frame to every admin session.
    pub async fn broadcast_to_admins(&self, frame: SocketFrame) -> usize {
        let targets: Vec<Arc<SessionEntry>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .flatten()
                .filter(|entry| entry.is_admin)
                .cloned()
                .collect()
        };

        let mut reached = 0;
        for entry in targets {
            let mut admin_frame = frame.clone();
            admin_frame.user_id = entry.user_id.clone();
            if entry.sender.try_send(admin_frame).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Client heartbeat; sessions silent beyond 2x the interval are closed by
    /// the sweep task.
    pub async fn heartbeat(&self, user_id: &str, session_id: &str) {
        let sessions = self.sessions.read().await;
        if let Some(entries) = sessions.get(user_id) {
            if let Some(entry) = entries.iter().find(|e| e.session_id == session_id) {
                entry.touch();
            }
        }
    }

    /// Client acknowledgement for a delivered frame. Upgrades SENT ->
    /// DELIVERED when the ack arrives within the configured window.
    pub async fn ack(&self, notification_id: &str) -> NotifyResult<()> {
        let record = self.history.get(notification_id).await?;
        if record.status != NotificationStatus::Sent {
            self.logger.debug(&format!(
                "ack ignored for {} in status {}",
                notification_id, record.status
            ));
            return Ok(());
        }

        let window = Duration::seconds(self.config.ack_window_seconds);
        let in_window = record
            .last_attempt_at
            .map(|at| Utc::now() - at <= window)
            .unwrap_or(true);
        if !in_window {
            self.logger.debug(&format!(
                "ack outside delivery window for {}",
                notification_id
            ));
            return Ok(());
        }

        self.history
            .update_status(notification_id, NotificationStatus::Delivered, None, "socket-hub")
            .await?;
        Ok(())
    }

    /// In-app read receipt.
    pub async fn mark_read(&self, notification_id: &str) -> NotifyResult<()> {
        self.history.mark_read(notification_id).await?;
        Ok(())
    }

    pub async fn pending_count(&self, user_id: &str) -> usize {
        let pending = self.pending.read().await;
        pending.get(user_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Close sessions that have been silent beyond the timeout.
    pub async fn sweep_stale_sessions(&self) -> usize {
        let timeout = self.config.session_timeout();
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        sessions.retain(|user_id, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.silent_since() <= timeout);
            let dropped = before - entries.len();
            if dropped > 0 {
                removed += dropped;
                self.logger
                    .info(&format!("closed {} stale session(s) for user {}", dropped, user_id));
            }
            !entries.is_empty()
        });
        removed
    }

    /// Periodic heartbeat sweep.
    pub fn spawn_heartbeat_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let interval = std::time::Duration::from_secs(hub.config.heartbeat_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                hub.sweep_stale_sessions().await;
            }
        })
    }

    async fn park(&self, user_id: &str, frame: SocketFrame) {
        let mut pending = self.pending.write().await;
        let queue = pending.entry(user_id.to_string()).or_default();
        while queue.len() >= self.config.max_pending_frames_per_user {
            queue.pop_front();
        }
        queue.push_back(frame);
        self.logger.debug(&format!(
            "parked frame for offline user {} (pending={})",
            user_id,
            queue.len()
        ));
    }

    async fn flush_pending(&self, user_id: &str, entry: &Arc<SessionEntry>) {
        let frames: Vec<SocketFrame> = {
            let mut pending = self.pending.write().await;
            pending
                .remove(user_id)
                .map(|queue| queue.into_iter().collect())
                .unwrap_or_default()
        };

        for frame in frames {
            let message_id = frame.message_id.clone();
            if entry.sender.try_send(frame).is_ok() {
                // Held frames count as delivered once a session picks them up.
                if let Err(e) = self
                    .history
                    .update_status(&message_id, NotificationStatus::Delivered, None, "socket-hub")
                    .await
                {
                    self.logger.debug(&format!(
                        "pending flush status update skipped for {}: {}",
                        message_id, e
                    ));
                }
            }
        }
    }
}
