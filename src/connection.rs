//! The per-device connection actor.
//!
//! One [`Connection`] owns the physical link lifecycle for one device
//! address: it establishes the link, drives service discovery, hands the
//! single in-flight request slot to one operation at a time, demultiplexes
//! every platform event to whichever operation currently holds that slot,
//! fans notifications out to registered listeners, and tears the link down
//! when nothing needs it anymore.
//!
//! All state lives behind one mutex that is never held across an await;
//! every observer side effect is dispatched on a fresh task outside the
//! lock, and slot handover is scheduled rather than recursed into.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::command::{CommandResult, CommandStatus};
use crate::platform::{BleAdapter, GattEvent, GattLink};
use crate::types::{Address, ConnectionState, GattError, GattStatus, Result, Transport};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Events delivered to the operation holding (or waiting for) the link.
#[derive(Clone)]
pub(crate) enum TokenEvent {
    /// The slot is granted and services are discovered; start issuing
    /// commands against `link`.
    Ready { link: Arc<dyn GattLink> },
    /// The link dropped or the connection attempt failed.
    ConnectionLost { status: CommandStatus },
    Gatt(GattEvent),
}

/// An opaque claim ticket for the connection's single request slot.
#[derive(Clone)]
pub(crate) struct OperationToken {
    id: u64,
    tx: mpsc::UnboundedSender<TokenEvent>,
}

impl OperationToken {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TokenEvent>) -> Self {
        Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, event: TokenEvent) {
        let _ = self.tx.send(event);
    }
}

/// Identifies one registered listener or handler, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Vote cast by a [`ConnectionHandler`] when the connection goes idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    Disconnect,
    KeepAlive,
}

/// Polled when a connection has no work left, to decide whether the link
/// should be kept open anyway.
pub trait ConnectionHandler: Send + Sync {
    fn on_connection_idle(&self, connection: &Connection) -> IdleDecision;
}

/// Observer of connection lifecycle events. Methods default to no-ops so
/// implementations pick what they care about.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_state_changed(&self, connection: &Connection, state: ConnectionState) {
        let _ = (connection, state);
    }

    fn on_services_discovered(&self, connection: &Connection) {
        let _ = connection;
    }
}

/// Receives notification/indication payloads for one characteristic.
pub trait CharacteristicListener: Send + Sync {
    fn on_characteristic_changed(&self, change: &CommandResult);
}

impl<F> CharacteristicListener for F
where
    F: Fn(&CommandResult) + Send + Sync,
{
    fn on_characteristic_changed(&self, change: &CommandResult) {
        self(change)
    }
}

struct Inner {
    state: ConnectionState,
    transport: Transport,
    services_discovered: bool,
    link: Option<Arc<dyn GattLink>>,
    /// Bumped on every teardown so events from a dead link are dropped.
    epoch: u64,
    current: Option<OperationToken>,
    queue: VecDeque<OperationToken>,
    change_listeners: HashMap<Uuid, Vec<(ListenerId, Arc<dyn CharacteristicListener>)>>,
    connection_listeners: Vec<(ListenerId, Arc<dyn ConnectionListener>)>,
    handlers: Vec<(ListenerId, Arc<dyn ConnectionHandler>)>,
    next_listener_id: u64,
}

/// The actor managing the link to one device. Obtained from
/// [`crate::registry::Central::connection`]; one instance is shared by every
/// operation, subscription and monitor targeting the address.
pub struct Connection {
    address: Address,
    adapter: Arc<dyn BleAdapter>,
    inner: Mutex<Inner>,
    this: Weak<Connection>,
}

impl Connection {
    pub(crate) fn new(address: Address, adapter: Arc<dyn BleAdapter>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            address,
            adapter,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                transport: Transport::default(),
                services_discovered: false,
                link: None,
                epoch: 0,
                current: None,
                queue: VecDeque::new(),
                change_listeners: HashMap::new(),
                connection_listeners: Vec::new(),
                handlers: Vec::new(),
                next_listener_id: 1,
            }),
            this: this.clone(),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// True while connected and the service database is available.
    pub fn services_discovered(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.services_discovered && inner.state == ConnectionState::Connected
    }

    pub fn set_transport(&self, transport: Transport) {
        self.inner.lock().unwrap().transport = transport;
    }

    /// Request an RSSI read; the result reaches the operation currently
    /// holding the link as a [`GattEvent::RssiRead`].
    pub fn read_rssi(&self) -> Result<()> {
        let link = self.inner.lock().unwrap().link.clone();
        link.ok_or(GattError::NotConnected)?.read_rssi()
    }

    // ---- listener registries ----

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.connection_listeners.push((id, listener));
        id
    }

    pub fn remove_connection_listener(&self, id: ListenerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.connection_listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn add_connection_handler(&self, handler: Arc<dyn ConnectionHandler>) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.handlers.push((id, handler));
        id
    }

    pub fn remove_connection_handler(&self, id: ListenerId) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.handlers.retain(|(hid, _)| *hid != id);
        }
        // the removed vote may have been the only thing keeping us up
        self.spawn_idle_check();
    }

    pub fn add_change_listener(
        &self,
        characteristic: Uuid,
        listener: Arc<dyn CharacteristicListener>,
    ) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner
            .change_listeners
            .entry(characteristic)
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove_change_listener(&self, characteristic: Uuid, id: ListenerId) {
        let check_idle = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(list) = inner.change_listeners.get_mut(&characteristic) {
                list.retain(|(lid, _)| *lid != id);
                if list.is_empty() {
                    inner.change_listeners.remove(&characteristic);
                }
            }
            inner.current.is_none() && inner.queue.is_empty()
        };
        if check_idle {
            self.spawn_idle_check();
        }
    }

    /// Number of listeners registered for a characteristic. Unsubscribe
    /// commands consult this to avoid silencing other listeners.
    pub fn change_listener_count(&self, characteristic: Uuid) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .change_listeners
            .get(&characteristic)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    // ---- lifecycle ----

    /// Establish the link. No-op while already connecting or connected;
    /// safe to call from any task at any time.
    pub fn connect(&self) {
        if !self.adapter.is_enabled() {
            let busy = {
                let inner = self.inner.lock().unwrap();
                inner.state != ConnectionState::Disconnected || inner.link.is_some()
            };
            if !busy {
                debug!("adapter is off, won't connect to {}", self.address);
                self.connection_failed(CommandStatus::AdapterDisabled);
            }
            return;
        }
        let (transport, epoch) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnectionState::Disconnected || inner.link.is_some() {
                return;
            }
            inner.state = ConnectionState::Connecting;
            inner.epoch += 1;
            (inner.transport, inner.epoch)
        };
        debug!("connecting to {}", self.address);
        self.notify_state_change(ConnectionState::Connecting);

        let Some(conn) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            conn.open_link(transport, epoch).await;
        });
    }

    async fn open_link(self: Arc<Self>, transport: Transport, epoch: u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.adapter.open_link(self.address, transport, tx).await {
            Ok(link) => {
                let stale = {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
                        true
                    } else {
                        inner.link = Some(Arc::clone(&link));
                        false
                    }
                };
                if stale {
                    // torn down while the request was in flight
                    link.disconnect();
                    return;
                }
                let conn = Arc::clone(&self);
                tokio::spawn(async move {
                    conn.pump_events(rx, epoch).await;
                });
            }
            Err(e) => {
                warn!("link request to {} failed: {}", self.address, e);
                let status = match e {
                    GattError::AdapterDisabled => CommandStatus::AdapterDisabled,
                    _ => CommandStatus::Failure(GattStatus::FAILURE),
                };
                self.connection_failed(status);
            }
        }
    }

    /// Tear the link down and fail everything in flight. Pending operations
    /// always receive a terminal callback.
    pub fn disconnect(&self) {
        info!("disconnecting from {}", self.address);
        self.connection_failed(CommandStatus::Failure(GattStatus::FAILURE));
    }

    async fn pump_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<GattEvent>, epoch: u64) {
        while let Some(event) = rx.recv().await {
            if !self.handle_gatt_event(epoch, event) {
                break;
            }
        }
    }

    /// Route one platform event. Returns false once the event belongs to a
    /// torn-down link, which ends the pump.
    fn handle_gatt_event(&self, epoch: u64, event: GattEvent) -> bool {
        if self.inner.lock().unwrap().epoch != epoch {
            debug!("dropping event from a stale link to {}", self.address);
            return false;
        }
        match event {
            GattEvent::ConnectionStateChanged { status, connected } => {
                self.on_connection_state_changed(status, connected);
            }
            GattEvent::ServicesDiscovered { status } => {
                self.on_services_discovered(status);
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                self.on_characteristic_changed(characteristic, value);
            }
            other => self.route_to_current(other),
        }
        true
    }

    fn on_connection_state_changed(&self, status: GattStatus, connected: bool) {
        debug!(
            "connection state of {} changed: connected={} status={}",
            self.address, connected, status
        );
        if connected && status.is_success() {
            let link = self.inner.lock().unwrap().link.clone();
            let Some(link) = link else { return };
            if let Err(e) = link.discover_services() {
                warn!("failed to start service discovery on {}: {}", self.address, e);
                link.disconnect();
                self.connection_failed(CommandStatus::Failure(GattStatus::FAILURE));
            } else {
                self.connection_success();
            }
        } else {
            let status = if status.is_success() {
                GattStatus::FAILURE
            } else {
                status
            };
            self.connection_failed(CommandStatus::Failure(status));
        }
    }

    fn connection_success(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.services_discovered = false;
            inner.state = ConnectionState::Connected;
        }
        self.notify_state_change(ConnectionState::Connected);
    }

    fn on_services_discovered(&self, status: GattStatus) {
        if !status.is_success() {
            self.connection_failed(CommandStatus::Failure(status));
            return;
        }
        self.inner.lock().unwrap().services_discovered = true;
        self.notify_services_discovered();
        self.resume();
    }

    /// Reset to `Disconnected` and notify the current and every queued
    /// operation of the failure. The operations stay current/queued; their
    /// engines decide whether to retry or finish.
    fn connection_failed(&self, status: CommandStatus) {
        let (link, current, queued, old_state) = {
            let mut inner = self.inner.lock().unwrap();
            inner.epoch += 1;
            let old_state = inner.state;
            inner.state = ConnectionState::Disconnected;
            inner.services_discovered = false;
            (
                inner.link.take(),
                inner.current.clone(),
                inner.queue.iter().cloned().collect::<Vec<_>>(),
                old_state,
            )
        };
        if let Some(link) = link {
            link.disconnect();
        }
        if current.is_some() || !queued.is_empty() {
            info!(
                "connection to {} failed ({}), notifying all pending operations",
                self.address, status
            );
        }
        if let Some(token) = current {
            token.send(TokenEvent::ConnectionLost { status });
        }
        for token in queued {
            token.send(TokenEvent::ConnectionLost { status });
        }
        if old_state != ConnectionState::Disconnected {
            self.notify_state_change(ConnectionState::Disconnected);
        }
    }

    // ---- the request slot ----

    /// Claim the link for an operation. Re-submitting a token that is
    /// already current or queued is idempotent; a re-submitted current
    /// token gets the slot re-granted once the link is ready (this is how
    /// a retrying operation re-acquires the link).
    pub(crate) fn execute(&self, token: OperationToken) {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            let is_current = inner.current.as_ref().map(OperationToken::id) == Some(token.id);
            let is_queued = inner.queue.iter().any(|t| t.id == token.id);
            let was_idle = inner.current.is_none();
            if is_current || is_queued {
                debug!("restarting operation {} on {}", token.id, self.address);
            } else if was_idle && inner.queue.is_empty() {
                debug!("operation {} takes the slot on {}", token.id, self.address);
                inner.current = Some(token);
            } else {
                debug!("queueing operation {} on {}", token.id, self.address);
                inner.queue.push_back(token);
            }
            (was_idle || is_current)
                && inner.services_discovered
                && inner.state == ConnectionState::Connected
        };
        if ready {
            self.schedule_resume();
        } else {
            self.connect();
        }
    }

    /// Release the slot (or leave the queue). Called by the operation when
    /// its whole sequence is done or cancelled.
    pub(crate) fn execute_finished(&self, token_id: u64) {
        let resume = {
            let mut inner = self.inner.lock().unwrap();
            if inner.current.as_ref().map(OperationToken::id) == Some(token_id) {
                debug!("operation {} finished on {}", token_id, self.address);
                inner.current = None;
                true
            } else {
                debug!("operation {} removed from queue on {}", token_id, self.address);
                inner.queue.retain(|t| t.id != token_id);
                false
            }
        };
        if resume {
            // scheduled, not inline: long operation chains must not recurse
            self.schedule_resume();
        }
    }

    fn schedule_resume(&self) {
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            conn.resume();
        });
    }

    /// Hand the slot to the next operation, or consider dropping the link
    /// when there is nothing left to do.
    fn resume(&self) {
        enum Next {
            Grant(OperationToken, Arc<dyn GattLink>),
            Connect,
        }
        let next = {
            let mut inner = self.inner.lock().unwrap();
            if inner.current.is_none() {
                match inner.queue.pop_front() {
                    Some(token) => inner.current = Some(token),
                    None => {
                        let idle = inner.change_listeners.is_empty();
                        drop(inner);
                        if idle {
                            self.disconnect_on_idle();
                        }
                        return;
                    }
                }
            }
            let ready = inner.services_discovered && inner.state == ConnectionState::Connected;
            match (ready, inner.current.clone(), inner.link.clone()) {
                (true, Some(token), Some(link)) => Next::Grant(token, link),
                _ => Next::Connect,
            }
        };
        match next {
            Next::Grant(token, link) => {
                debug!("resuming with operation {} on {}", token.id, self.address);
                if token.tx.send(TokenEvent::Ready { link }).is_err() {
                    // the operation is gone; free the slot for the next one
                    debug!("operation {} is gone on {}", token.id, self.address);
                    self.execute_finished(token.id);
                }
            }
            Next::Connect => {
                debug!("will resume once {} is ready", self.address);
                self.connect();
            }
        }
    }

    fn spawn_idle_check(&self) {
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            conn.disconnect_on_idle();
        });
    }

    /// Drop the link if nothing objects: no notification listeners, no
    /// pending or current operation, and no keep-alive vote. The conditions
    /// are re-checked under the lock so a concurrently submitted operation
    /// wins over the teardown.
    fn disconnect_on_idle(&self) {
        let handlers = {
            let inner = self.inner.lock().unwrap();
            inner.handlers.clone()
        };
        let keep_alive = handlers
            .iter()
            .any(|(_, h)| h.on_connection_idle(self) == IdleDecision::KeepAlive);

        let link = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.change_listeners.is_empty() {
                info!(
                    "{} is idle but subscriptions are keeping the connection alive",
                    self.address
                );
                return;
            }
            if inner.current.is_some() || !inner.queue.is_empty() {
                return;
            }
            if keep_alive {
                info!("{} is idle but keep alive is set", self.address);
                return;
            }
            if inner.link.is_none() {
                return;
            }
            inner.epoch += 1;
            inner.state = ConnectionState::Disconnected;
            inner.services_discovered = false;
            inner.link.take()
        };
        if let Some(link) = link {
            info!("disconnecting from {} on idle", self.address);
            link.disconnect();
            self.notify_state_change(ConnectionState::Disconnected);
        }
    }

    // ---- event fan-out ----

    fn route_to_current(&self, event: GattEvent) {
        let current = self.inner.lock().unwrap().current.clone();
        if let Some(token) = current {
            token.send(TokenEvent::Gatt(event));
        }
    }

    fn on_characteristic_changed(&self, characteristic: Uuid, value: Vec<u8>) {
        let (current, listeners) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.current.clone(),
                inner
                    .change_listeners
                    .get(&characteristic)
                    .cloned()
                    .unwrap_or_default(),
            )
        };
        // the executing command sees the change first: it may have enabled
        // the notification as part of its own exchange
        if let Some(token) = current {
            token.send(TokenEvent::Gatt(GattEvent::CharacteristicChanged {
                characteristic,
                value: value.clone(),
            }));
        }
        if listeners.is_empty() {
            return;
        }
        let change = CommandResult::characteristic_changed(characteristic, value);
        tokio::spawn(async move {
            for (_, listener) in listeners {
                listener.on_characteristic_changed(&change);
            }
        });
    }

    fn notify_state_change(&self, state: ConnectionState) {
        debug!("connection state of {} is now {}", self.address, state);
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let listeners = {
                let inner = conn.inner.lock().unwrap();
                if inner.state != state {
                    debug!("state change notification for {} expired", conn.address);
                    return;
                }
                inner.connection_listeners.clone()
            };
            for (_, listener) in listeners {
                listener.on_connection_state_changed(&conn, state);
            }
        });
    }

    fn notify_services_discovered(&self) {
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let listeners = {
                let inner = conn.inner.lock().unwrap();
                if !(inner.services_discovered && inner.state == ConnectionState::Connected) {
                    debug!("services discovered notification for {} expired", conn.address);
                    return;
                }
                inner.connection_listeners.clone()
            };
            for (_, listener) in listeners {
                listener.on_services_discovered(&conn);
            }
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
