//! Lifecycle of one physical robot link.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                      |             |
//!                      +-> Error <---+   (open failure / transport loss)
//!                            |
//!                            +-> Disconnected
//! ```
//!
//! The link never reconnects on its own. Every bus operation holds the
//! client lock, so `disconnect` only completes once in-flight I/O is done.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::bus::{BusConfig, ServoBusClient, SyncEntry, SyncWriteOutcome};
use crate::error::{BusError, TransportError};
use crate::joint::ServoId;
use crate::transport::{BoxedTransport, PortRequest, TransportProvider};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the arm on the other end of the link is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkRole {
    /// Driven arm: torque on while connected.
    Follower,
    /// Hand-moved arm that is read back: torque off.
    Leader,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Follower => f.write_str("follower"),
            LinkRole::Leader => f.write_str("leader"),
        }
    }
}

type Client = ServoBusClient<BoxedTransport>;

pub struct RobotLink {
    role: LinkRole,
    provider: Arc<dyn TransportProvider>,
    bus: BusConfig,
    servo_ids: Vec<ServoId>,
    state: watch::Sender<ConnectionState>,
    client: Mutex<Option<Client>>,
}

impl RobotLink {
    pub fn new(
        role: LinkRole,
        provider: Arc<dyn TransportProvider>,
        bus: BusConfig,
        servo_ids: Vec<ServoId>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            role,
            provider,
            bus,
            servo_ids,
            state,
            client: Mutex::new(None),
        }
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!("{} link: {} -> {}", self.role, prev, next);
        }
    }

    /// Open the transport and prepare the servos for this link's role.
    pub async fn connect(&self, request: &PortRequest) -> Result<(), TransportError> {
        let mut guard = self.client.lock().await;
        if self.state() != ConnectionState::Disconnected {
            return Err(TransportError::AlreadyOpen);
        }
        self.set_state(ConnectionState::Connecting);

        // Port lookup and open are blocking OS calls.
        let provider = self.provider.clone();
        let owned = request.clone();
        let opened = tokio::task::spawn_blocking(move || provider.open(&owned))
            .await
            .unwrap_or_else(|e| Err(TransportError::Io(io::Error::new(io::ErrorKind::Other, e))));
        let io = match opened {
            Ok(io) => io,
            Err(e) => {
                tracing::warn!("Failed to open {} link: {}", self.role, e);
                self.set_state(ConnectionState::Error);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let mut client = ServoBusClient::new(io, self.bus.family, self.bus.response_timeout());
        let torque = self.role == LinkRole::Follower;
        for &id in &self.servo_ids {
            match client.write_torque_enable(id, torque).await {
                Ok(()) => {}
                Err(BusError::Io(e)) => {
                    tracing::warn!("{} link lost while initialising servo {}: {}", self.role, id, e);
                    self.set_state(ConnectionState::Error);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(TransportError::Io(e));
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to {} torque on {} servo {}: {}",
                        if torque { "enable" } else { "disable" },
                        self.role,
                        id,
                        e
                    );
                }
            }
        }

        *guard = Some(client);
        self.set_state(ConnectionState::Connected);
        tracing::info!("{} link connected ({} servos)", self.role, self.servo_ids.len());
        Ok(())
    }

    /// Close the link. Calling it on a closed link is a no-op.
    pub async fn disconnect(&self) {
        let mut guard = self.client.lock().await;
        let Some(mut client) = guard.take() else {
            if self.state() != ConnectionState::Disconnected {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        };
        self.set_state(ConnectionState::Disconnecting);

        if self.role == LinkRole::Follower {
            for &id in &self.servo_ids {
                if let Err(e) = client.write_torque_enable(id, false).await {
                    tracing::debug!("Could not release torque on servo {}: {}", id, e);
                    if e.is_transport_failure() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = client.shutdown().await {
            tracing::debug!("Transport shutdown failed: {}", e);
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("{} link disconnected", self.role);
    }

    /// Tear the link down after a transport failure.
    async fn fail(&self, guard: &mut MutexGuard<'_, Option<Client>>, err: &BusError) {
        tracing::warn!("{} link failed: {}", self.role, err);
        self.set_state(ConnectionState::Error);
        if let Some(mut client) = guard.take() {
            let _ = client.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    pub async fn sync_write(&self, entries: &[SyncEntry]) -> Result<SyncWriteOutcome, BusError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(BusError::NotConnected)?;
        let outcome = client.sync_write(entries).await;
        if let Some((_, err)) = outcome.failed.iter().find(|(_, e)| e.is_transport_failure()) {
            let err = err.duplicate();
            self.fail(&mut guard, &err).await;
        }
        Ok(outcome)
    }

    pub async fn read_position(&self, id: ServoId) -> Result<f64, BusError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(BusError::NotConnected)?;
        let result = client.read_position(id).await;
        if let Err(e) = &result {
            if e.is_transport_failure() {
                self.fail(&mut guard, e).await;
            }
        }
        result
    }

    /// Read several servos at once. Per-servo failures stay in the list; a
    /// lost transport fails the whole call and tears the link down.
    pub async fn read_positions(
        &self,
        ids: &[ServoId],
    ) -> Result<Vec<(ServoId, Result<f64, BusError>)>, BusError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(BusError::NotConnected)?;
        let results = client.read_positions(ids).await;
        let lost = results.iter().find_map(|(_, r)| match r {
            Err(e) if e.is_transport_failure() => Some(e.duplicate()),
            _ => None,
        });
        if let Some(e) = lost {
            self.fail(&mut guard, &e).await;
            return Err(e);
        }
        Ok(results)
    }

    pub async fn write_torque_enable(&self, id: ServoId, enable: bool) -> Result<(), BusError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(BusError::NotConnected)?;
        let result = client.write_torque_enable(id, enable).await;
        if let Err(e) = &result {
            if e.is_transport_failure() {
                self.fail(&mut guard, e).await;
            }
        }
        result
    }

    pub fn servo_ids(&self) -> &[ServoId] {
        &self.servo_ids
    }
}
