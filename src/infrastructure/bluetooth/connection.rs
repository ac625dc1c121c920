//! BLE Connection Module
//!
//! Handles the pair -> connect -> communicate -> unpair lifecycle of a vehicle.

use crate::domain::models::{
    format_mac, AppEvent, ConnectionState, MessageSeverity, StatusMessage,
};
use crate::infrastructure::bluetooth::protocol::{self, ProtocolError, VehicleCommand};
use crate::infrastructure::bluetooth::transport::{
    LinkStatus, PairingStatus, TransportError, UnpairingStatus, VehicleTransport,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How `connect_with_retry` behaves between failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` keeps trying until cancelled
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Cancellation signal shared between the operator and a running session
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any token clone, so this only ends on cancel
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub service_uuid: String,
    pub read_char_uuid: String,
    pub write_char_uuid: String,
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID.to_string(),
            read_char_uuid: protocol::READ_CHAR_UUID.to_string(),
            write_char_uuid: protocol::WRITE_CHAR_UUID.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    PairingFailed,
    ConnectFailed(TransportError),
}

/// Drives pairing and connection for vehicles. Sole owner of `ConnectionState`.
pub struct PairingConnectionManager {
    transport: Arc<dyn VehicleTransport>,
    config: ConnectionConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    states: Mutex<HashMap<u64, ConnectionState>>,
}

impl PairingConnectionManager {
    pub fn new(
        transport: Arc<dyn VehicleTransport>,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            event_sender,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, mac_address: u64) -> ConnectionState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&mac_address).copied())
            .unwrap_or(ConnectionState::Discovered)
    }

    fn set_state(&self, mac_address: u64, next: ConnectionState) {
        let current = self.state(mac_address);
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                "Ignoring transition {:?} -> {:?} for {}",
                current,
                next,
                format_mac(mac_address)
            );
            return;
        }
        if let Ok(mut states) = self.states.lock() {
            states.insert(mac_address, next);
        }
        debug!("{}: {:?} -> {:?}", format_mac(mac_address), current, next);
        let _ = self.event_sender.send(AppEvent::ConnectionState {
            mac_address,
            state: next,
        });
    }

    /// Clear any pairing left over from an earlier session.
    ///
    /// Returns whether a pairing was found and cleared.
    pub async fn ensure_unpaired(&self, mac_address: u64) -> Result<bool, TransportError> {
        if !self.transport.is_paired(mac_address).await? {
            self.set_state(mac_address, ConnectionState::Unpaired);
            return Ok(false);
        }

        info!("{} already paired, clearing pairing", format_mac(mac_address));
        self.set_state(mac_address, ConnectionState::PairedElsewhere);
        Ok(self.unpair(mac_address).await)
    }

    /// Pair with the vehicle. A non-paired status is reported as `Ok(false)`.
    pub async fn pair(&self, mac_address: u64) -> Result<bool, TransportError> {
        info!("Pairing with {}", format_mac(mac_address));
        let status = self.transport.pair(mac_address).await?;

        if status.is_paired() {
            if status == PairingStatus::AlreadyPaired {
                debug!("{} reported already paired", format_mac(mac_address));
            }
            self.set_state(mac_address, ConnectionState::Paired);
            Ok(true)
        } else {
            warn!("Pairing with {} failed: {:?}", format_mac(mac_address), status);
            Ok(false)
        }
    }

    /// Open the vehicle service, retrying per the configured policy.
    ///
    /// Returns the number of attempts it took.
    pub async fn connect_with_retry(
        &self,
        mac_address: u64,
        cancel: &CancelToken,
    ) -> Result<u32, TransportError> {
        let policy = self.config.retry;
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            attempts += 1;

            let failure = match self
                .transport
                .open_service(mac_address, &self.config.service_uuid)
                .await
            {
                Ok(LinkStatus::Connected) => {
                    info!(
                        "Connected to {} after {} attempt(s)",
                        format_mac(mac_address),
                        attempts
                    );
                    self.set_state(mac_address, ConnectionState::Connected);
                    return Ok(attempts);
                }
                Ok(LinkStatus::Disconnected) => {
                    TransportError::ServiceUnavailable(self.config.service_uuid.clone())
                }
                Err(e) => e,
            };

            debug!("Connect attempt {} failed: {}", attempts, failure);
            if policy.exhausted(attempts) {
                error!(
                    "Giving up on {} after {} attempts",
                    format_mac(mac_address),
                    attempts
                );
                return Err(failure);
            }

            tokio::select! {
                _ = tokio::time::sleep(policy.delay) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }
    }

    /// Route notifications from the read characteristic into `sink`
    pub async fn subscribe(
        &self,
        mac_address: u64,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.transport
            .subscribe(mac_address, &self.config.read_char_uuid, sink)
            .await?;
        self.set_state(mac_address, ConnectionState::Communicating);
        Ok(())
    }

    /// Encode and write one command. Encoding errors never reach the transport.
    pub async fn send(
        &self,
        mac_address: u64,
        command: &VehicleCommand,
    ) -> Result<(), SessionError> {
        let bytes = protocol::encode(command)?;
        debug!("[write] {:?}: {}", command.msg_id(), protocol::hex_string(&bytes));
        self.transport
            .write(mac_address, &self.config.write_char_uuid, &bytes)
            .await?;
        Ok(())
    }

    /// Remove the OS pairing. Returns `true` only when a pairing was removed;
    /// failures are logged and reported as `false`.
    pub async fn unpair(&self, mac_address: u64) -> bool {
        match self.transport.unpair(mac_address).await {
            Ok(UnpairingStatus::Unpaired) => {
                self.set_state(mac_address, ConnectionState::Unpaired);
                true
            }
            Ok(UnpairingStatus::AlreadyUnpaired) => {
                debug!("{} had no pairing to remove", format_mac(mac_address));
                false
            }
            Ok(status) => {
                warn!("Unpairing {} returned {:?}", format_mac(mac_address), status);
                self.send_log("Could not remove pairing", MessageSeverity::Warning);
                false
            }
            Err(e) => {
                warn!("Unpairing {} failed: {}", format_mac(mac_address), e);
                self.send_log("Could not remove pairing", MessageSeverity::Warning);
                false
            }
        }
    }

    /// Run a full session against one vehicle.
    ///
    /// `communicate` runs once the notification channel is wired up. The
    /// pairing is removed on every exit path.
    pub async fn run_session<F, Fut>(
        &self,
        mac_address: u64,
        notifications: mpsc::UnboundedSender<Vec<u8>>,
        cancel: &CancelToken,
        communicate: F,
    ) -> SessionOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let outcome = self
            .session_steps(mac_address, notifications, cancel, communicate)
            .await;
        self.unpair(mac_address).await;
        outcome
    }

    async fn session_steps<F, Fut>(
        &self,
        mac_address: u64,
        notifications: mpsc::UnboundedSender<Vec<u8>>,
        cancel: &CancelToken,
        communicate: F,
    ) -> SessionOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if let Err(e) = self.ensure_unpaired(mac_address).await {
            warn!("Could not check existing pairing: {}", e);
        }

        match self.pair(mac_address).await {
            Ok(true) => {}
            Ok(false) => {
                self.send_log("Pairing failed", MessageSeverity::Error);
                return SessionOutcome::PairingFailed;
            }
            Err(e) => {
                error!("Pairing error: {}", e);
                self.send_log(&format!("Pairing failed: {}", e), MessageSeverity::Error);
                return SessionOutcome::PairingFailed;
            }
        }

        self.send_log("Connecting (press ctrl-c to cancel)...", MessageSeverity::Info);
        if let Err(e) = self.connect_with_retry(mac_address, cancel).await {
            self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
            return SessionOutcome::ConnectFailed(e);
        }

        if let Err(e) = self.subscribe(mac_address, notifications).await {
            self.send_log(&format!("Subscription failed: {}", e), MessageSeverity::Error);
            return SessionOutcome::ConnectFailed(e);
        }
        self.send_log("Connection established!", MessageSeverity::Success);

        if let Err(e) = communicate().await {
            error!("Session error: {:#}", e);
            self.send_log(&e.to_string(), MessageSeverity::Error);
        }
        self.set_state(mac_address, ConnectionState::Disconnected);
        SessionOutcome::Completed
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
