//! Single broker connection with reconnection and status fan-out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use auditflow_application::ConnectionStatus;
use auditflow_core::{AppError, AppResult};
use lapin::options::ConfirmSelectOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::retry::{Backoff, retry_with_backoff};

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct AmqpConnectionConfig {
    /// AMQP URI.
    pub url: String,
    /// Name reported to the broker.
    pub connection_name: String,
    /// Deadline of the initial connect.
    pub connect_timeout: Duration,
    /// Deadline of every reconnect cycle.
    pub reconnect_timeout: Duration,
    /// Reconnect cycles attempted after a drop before giving up.
    pub max_reconnect_cycles: u32,
    /// Delay policy between dial attempts.
    pub backoff: Backoff,
}

impl AmqpConnectionConfig {
    /// Creates settings for `url` with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: "auditflow".to_owned(),
            connect_timeout: Duration::from_secs(300),
            reconnect_timeout: Duration::from_secs(60),
            max_reconnect_cycles: 3,
            backoff: Backoff::default(),
        }
    }
}

struct Session {
    connection: Connection,
    channel: Channel,
}

#[derive(Default)]
struct StatusRegistry {
    status: ConnectionStatus,
    listeners: Vec<mpsc::UnboundedSender<ConnectionStatus>>,
    closed: bool,
}

impl StatusRegistry {
    fn publish(&mut self, status: ConnectionStatus) {
        if self.closed || self.status == status {
            return;
        }

        debug!(from = self.status.as_str(), to = status.as_str(), "connection status changed");
        self.status = status;
        self.listeners
            .retain(|listener| listener.send(status).is_ok());
    }
}

/// Owns the broker connection and the channel every transport call uses.
pub struct AmqpConnectionManager {
    config: AmqpConnectionConfig,
    session: RwLock<Option<Session>>,
    registry: Mutex<StatusRegistry>,
    generation: AtomicU64,
    drop_sender: mpsc::UnboundedSender<(u64, String)>,
    drops: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, String)>>,
    stop_signal: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl AmqpConnectionManager {
    /// Creates an idle manager. Nothing is dialed until [`Self::connect`].
    #[must_use]
    pub fn new(config: AmqpConnectionConfig) -> Self {
        let (drop_sender, drops) = mpsc::unbounded_channel();
        let (stop_signal, _) = watch::channel(false);

        Self {
            config,
            session: RwLock::new(None),
            registry: Mutex::new(StatusRegistry::default()),
            generation: AtomicU64::new(0),
            drop_sender,
            drops: tokio::sync::Mutex::new(drops),
            stop_signal,
            stopped: AtomicBool::new(false),
        }
    }

    /// Returns the settings.
    #[must_use]
    pub fn config(&self) -> &AmqpConnectionConfig {
        &self.config
    }

    /// Dials the broker with incremental backoff bounded by `timeout`.
    pub async fn connect(&self, timeout: Duration) -> AppResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AppError::Conflict(
                "connection manager was stopped".to_owned(),
            ));
        }

        self.update_status(ConnectionStatus::Connecting);

        let mut stop = self.stop_signal.subscribe();
        let dialed = tokio::select! {
            dialed = retry_with_backoff(
                &self.config.backoff,
                timeout,
                "amqp connect",
                |attempt| self.dial(attempt),
            ) => dialed,
            _ = stop.wait_for(|stopped| *stopped) => Err(AppError::Cancelled(
                "connect interrupted by stop".to_owned(),
            )),
        };

        let (connection, channel) = match dialed {
            Ok(session) => session,
            Err(connect_error) => {
                error!(error = %connect_error, "broker connection failed");
                self.update_status(ConnectionStatus::ConnectionFailed);
                return Err(connect_error);
            }
        };

        let mut session = self.session.write().await;
        if self.stopped.load(Ordering::SeqCst) {
            drop(session);
            close_session(Session {
                connection,
                channel,
            })
            .await;
            return Err(AppError::Cancelled(
                "connection manager stopped while dialing".to_owned(),
            ));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let drop_sender = self.drop_sender.clone();
        connection.on_error(move |connection_error| {
            let _ = drop_sender.send((generation, connection_error.to_string()));
        });

        *session = Some(Session {
            connection,
            channel,
        });
        self.update_status(ConnectionStatus::Connected);
        drop(session);
        info!(
            connection_name = %self.config.connection_name,
            generation,
            "broker connection established"
        );

        Ok(())
    }

    async fn dial(&self, attempt: u32) -> Result<(Connection, Channel), lapin::Error> {
        debug!(attempt, "dialing broker");
        let connection = Connection::connect(
            self.config.url.as_str(),
            ConnectionProperties::default()
                .with_connection_name(self.config.connection_name.clone().into()),
        )
        .await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok((connection, channel))
    }

    /// Watches the connection until [`Self::stop`], reconnecting after drops.
    ///
    /// After `max_reconnect_cycles` failed reconnects the status becomes
    /// `ConnectionFailed`, listeners are closed and `Unavailable` is returned.
    pub async fn maintain(&self) -> AppResult<()> {
        let mut stop = self.stop_signal.subscribe();
        let mut drops = self.drops.lock().await;

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                dropped = drops.recv() => {
                    let Some((generation, reason)) = dropped else {
                        break;
                    };
                    if generation != self.generation.load(Ordering::SeqCst) {
                        debug!(generation, "ignoring close notice of a replaced connection");
                        continue;
                    }

                    warn!(reason = %reason, "broker connection dropped");
                    self.update_status(ConnectionStatus::ConnectionDropped);
                    self.session.write().await.take();

                    if !self.reconnect(&stop).await {
                        if *stop.borrow() {
                            break;
                        }
                        self.close_listeners(ConnectionStatus::ConnectionFailed);
                        return Err(AppError::Unavailable(format!(
                            "broker unreachable after {} reconnect cycles",
                            self.config.max_reconnect_cycles
                        )));
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn reconnect(&self, stop: &watch::Receiver<bool>) -> bool {
        for cycle in 1..=self.config.max_reconnect_cycles {
            if *stop.borrow() {
                return false;
            }

            match self.connect(self.config.reconnect_timeout).await {
                Ok(()) => return true,
                Err(reconnect_error) => warn!(
                    cycle,
                    max_cycles = self.config.max_reconnect_cycles,
                    error = %reconnect_error,
                    "reconnect cycle failed"
                ),
            }
        }

        false
    }

    /// Closes channel and connection, publishes `ConnectionClosed` and closes
    /// every listener. Calling it again is a no-op.
    pub async fn stop(&self) {
        self.stop_signal.send_replace(true);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = self.session.write().await.take();
        if let Some(session) = session {
            close_session(session).await;
        }

        self.close_listeners(ConnectionStatus::ConnectionClosed);
        info!("broker connection closed");
    }

    /// Returns a receiver flipping to `true` once [`Self::stop`] was called.
    #[must_use]
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_signal.subscribe()
    }

    /// Returns the current channel, or `Unavailable` while disconnected.
    pub async fn channel(&self) -> AppResult<Channel> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.channel.clone())
            .ok_or_else(|| AppError::Unavailable("broker channel is not open".to_owned()))
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.lock_registry().status
    }

    /// Registers a listener for every later status change.
    pub fn notify_status_change(&self, listener: mpsc::UnboundedSender<ConnectionStatus>) {
        let mut registry = self.lock_registry();
        if !registry.closed {
            registry.listeners.push(listener);
        }
    }

    fn update_status(&self, status: ConnectionStatus) {
        self.lock_registry().publish(status);
    }

    /// Publishes a final status; later changes are ignored.
    fn close_listeners(&self, status: ConnectionStatus) {
        let mut registry = self.lock_registry();
        registry.publish(status);
        registry.closed = true;
        registry.listeners.clear();
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, StatusRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn close_session(session: Session) {
    if let Err(close_error) = session.channel.close(200, "shutdown").await {
        debug!(error = %close_error, "channel close failed");
    }
    if let Err(close_error) = session.connection.close(200, "shutdown").await {
        debug!(error = %close_error, "connection close failed");
    }
}
