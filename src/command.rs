//! GATT commands: one logical request against a live link.
//!
//! A command knows how to start itself on a [`GattLink`] and which link
//! events answer it. Commands are driven one at a time by an
//! [`crate::operation::Operation`]; the link serializes them device-wide.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::{Connection, TokenEvent};
use crate::platform::{
    GattEvent, GattLink, WriteType, CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::source::InputSource;
use crate::types::GattStatus;

/// Outcome classification of a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// The service is not present in the discovered database.
    ServiceNotFound,
    /// The characteristic is not present on the service.
    CharacteristicNotFound,
    /// The notification config descriptor is missing.
    DescriptorNotFound,
    /// The adapter was off when the connection was attempted.
    AdapterDisabled,
    /// A transport or firmware level failure, carrying the platform status.
    Failure(GattStatus),
}

impl CommandStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Success)
    }

    pub fn from_gatt(status: GattStatus) -> Self {
        if status.is_success() {
            CommandStatus::Success
        } else {
            CommandStatus::Failure(status)
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Success => write!(f, "success"),
            CommandStatus::ServiceNotFound => write!(f, "service not found"),
            CommandStatus::CharacteristicNotFound => write!(f, "characteristic not found"),
            CommandStatus::DescriptorNotFound => write!(f, "descriptor not found"),
            CommandStatus::AdapterDisabled => write!(f, "adapter disabled"),
            CommandStatus::Failure(status) => write!(f, "failure ({})", status),
        }
    }
}

/// The immutable outcome of one command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    characteristic: Option<Uuid>,
    value: Option<Vec<u8>>,
    status: CommandStatus,
    timestamp: SystemTime,
}

impl CommandResult {
    pub(crate) fn read(characteristic: Uuid, value: Option<Vec<u8>>, status: GattStatus) -> Self {
        Self {
            characteristic: Some(characteristic),
            value,
            status: CommandStatus::from_gatt(status),
            timestamp: SystemTime::now(),
        }
    }

    pub(crate) fn empty_success(characteristic: Uuid) -> Self {
        Self {
            characteristic: Some(characteristic),
            value: None,
            status: CommandStatus::Success,
            timestamp: SystemTime::now(),
        }
    }

    pub(crate) fn error(characteristic: Option<Uuid>, status: CommandStatus) -> Self {
        Self {
            characteristic,
            value: None,
            status,
            timestamp: SystemTime::now(),
        }
    }

    pub(crate) fn characteristic_changed(characteristic: Uuid, value: Vec<u8>) -> Self {
        Self {
            characteristic: Some(characteristic),
            value: Some(value),
            status: CommandStatus::Success,
            timestamp: SystemTime::now(),
        }
    }

    /// The characteristic this result belongs to. `None` only for failures
    /// synthesized on connection loss between commands.
    pub fn characteristic(&self) -> Option<Uuid> {
        self.characteristic
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn value_as_str(&self) -> Option<&str> {
        self.value().and_then(|v| std::str::from_utf8(v).ok())
    }

    /// The value as a big-endian unsigned integer of up to 4 bytes.
    pub fn value_as_u32(&self) -> Option<u32> {
        let value = self.value()?;
        if value.is_empty() || value.len() > 4 {
            return None;
        }
        Some(value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn successful(&self) -> bool {
        self.status.is_success()
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandResult[status: {}, characteristic: {:?}, data: {}]",
            self.status,
            self.characteristic,
            self.value.as_ref().map(|v| v.len()).unwrap_or(0)
        )
    }
}

/// Per-command completion callback.
pub trait CommandObserver: Send + Sync {
    fn on_command_finished(&self, result: &CommandResult);
}

/// A link event as seen by a running command.
#[derive(Debug, Clone)]
pub enum CommandEvent {
    Gatt(GattEvent),
    /// The link dropped (or the connection attempt failed) while the
    /// command was in flight.
    ConnectionLost { status: CommandStatus },
}

/// The stream of link events routed to the command currently holding the
/// link. Events for other requesters never show up here, but platform
/// callbacks can still race; commands must match UUIDs defensively.
pub struct CommandEvents<'a> {
    rx: &'a mut mpsc::UnboundedReceiver<TokenEvent>,
}

impl<'a> CommandEvents<'a> {
    pub(crate) fn new(rx: &'a mut mpsc::UnboundedReceiver<TokenEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> CommandEvent {
        loop {
            match self.rx.recv().await {
                Some(TokenEvent::Gatt(event)) => return CommandEvent::Gatt(event),
                Some(TokenEvent::ConnectionLost { status }) => {
                    return CommandEvent::ConnectionLost { status }
                }
                // A re-granted link mid-command carries no information for us.
                Some(TokenEvent::Ready { .. }) => continue,
                None => {
                    return CommandEvent::ConnectionLost {
                        status: CommandStatus::Failure(GattStatus::FAILURE),
                    }
                }
            }
        }
    }
}

/// Everything a command needs while it runs.
pub struct CommandContext<'a> {
    pub connection: &'a Arc<Connection>,
    pub link: &'a Arc<dyn GattLink>,
    pub events: CommandEvents<'a>,
}

/// A user-defined command, plugged in through [`Command::custom`].
///
/// Implementations drive the link directly and pull their completions from
/// `ctx.events`. A [`CommandEvent::ConnectionLost`] must terminate the run
/// with a failed result.
#[async_trait]
pub trait CustomCommand: Send {
    /// The characteristic this command targets, used for observer
    /// bookkeeping and logging.
    fn target(&self) -> Option<Uuid> {
        None
    }

    async fn run(&mut self, ctx: &mut CommandContext<'_>) -> CommandResult;

    /// Clean up after the run was abandoned mid-flight.
    fn cancel(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscribeOp {
    Notification,
    Indication,
    Unsubscribe,
}

enum CommandKind {
    Read {
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        write_type: WriteType,
        source: Arc<Mutex<Box<dyn InputSource>>>,
    },
    Subscribe {
        service: Uuid,
        characteristic: Uuid,
        op: SubscribeOp,
    },
    Custom {
        inner: Box<dyn CustomCommand>,
    },
}

/// One logical GATT request within an operation.
pub struct Command {
    kind: CommandKind,
    observer: Option<Arc<dyn CommandObserver>>,
}

impl Command {
    pub fn read(service: Uuid, characteristic: Uuid) -> Self {
        Self::from_kind(CommandKind::Read {
            service,
            characteristic,
        })
    }

    pub fn write(service: Uuid, characteristic: Uuid, source: Box<dyn InputSource>) -> Self {
        Self::write_with_type(service, characteristic, source, WriteType::WithResponse)
    }

    pub fn write_no_response(
        service: Uuid,
        characteristic: Uuid,
        source: Box<dyn InputSource>,
    ) -> Self {
        Self::write_with_type(service, characteristic, source, WriteType::NoResponse)
    }

    fn write_with_type(
        service: Uuid,
        characteristic: Uuid,
        source: Box<dyn InputSource>,
        write_type: WriteType,
    ) -> Self {
        Self::from_kind(CommandKind::Write {
            service,
            characteristic,
            write_type,
            source: Arc::new(Mutex::new(source)),
        })
    }

    /// Subscribe to notifications on a characteristic.
    pub fn subscribe(service: Uuid, characteristic: Uuid) -> Self {
        Self::from_kind(CommandKind::Subscribe {
            service,
            characteristic,
            op: SubscribeOp::Notification,
        })
    }

    /// Subscribe to indications on a characteristic.
    pub fn subscribe_indication(service: Uuid, characteristic: Uuid) -> Self {
        Self::from_kind(CommandKind::Subscribe {
            service,
            characteristic,
            op: SubscribeOp::Indication,
        })
    }

    pub fn unsubscribe(service: Uuid, characteristic: Uuid) -> Self {
        Self::from_kind(CommandKind::Subscribe {
            service,
            characteristic,
            op: SubscribeOp::Unsubscribe,
        })
    }

    pub fn custom(inner: Box<dyn CustomCommand>) -> Self {
        Self::from_kind(CommandKind::Custom { inner })
    }

    fn from_kind(kind: CommandKind) -> Self {
        Self {
            kind,
            observer: None,
        }
    }

    /// Attach a per-command completion observer.
    pub fn with_observer(mut self, observer: Arc<dyn CommandObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub(crate) fn observer(&self) -> Option<&Arc<dyn CommandObserver>> {
        self.observer.as_ref()
    }

    pub(crate) fn target(&self) -> Option<Uuid> {
        match &self.kind {
            CommandKind::Read { characteristic, .. }
            | CommandKind::Write { characteristic, .. }
            | CommandKind::Subscribe { characteristic, .. } => Some(*characteristic),
            CommandKind::Custom { inner } => inner.target(),
        }
    }

    pub(crate) async fn run(&mut self, ctx: &mut CommandContext<'_>) -> CommandResult {
        match &mut self.kind {
            CommandKind::Read {
                service,
                characteristic,
            } => run_read(*service, *characteristic, ctx).await,
            CommandKind::Write {
                service,
                characteristic,
                write_type,
                source,
            } => run_write(*service, *characteristic, *write_type, source, ctx).await,
            CommandKind::Subscribe {
                service,
                characteristic,
                op,
            } => run_subscribe(*service, *characteristic, *op, ctx).await,
            CommandKind::Custom { inner } => inner.run(ctx).await,
        }
    }

    /// Clean up after the run future was dropped mid-flight (cancellation
    /// or retry teardown).
    pub(crate) fn cancel(&mut self) {
        match &mut self.kind {
            CommandKind::Write { source, .. } => {
                // A blocking producer still holds the lock here and will
                // close the source itself once its channels drop.
                if let Ok(mut source) = source.try_lock() {
                    source.close();
                }
            }
            CommandKind::Custom { inner } => inner.cancel(),
            _ => {}
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CommandKind::Read {
                service,
                characteristic,
            } => write!(f, "Read[{} on {}]", characteristic, service),
            CommandKind::Write {
                service,
                characteristic,
                write_type,
                ..
            } => write!(
                f,
                "Write[{} on {}, {:?}]",
                characteristic, service, write_type
            ),
            CommandKind::Subscribe {
                service,
                characteristic,
                op,
            } => match op {
                SubscribeOp::Notification => {
                    write!(f, "SubscribeNotification[{} on {}]", characteristic, service)
                }
                SubscribeOp::Indication => {
                    write!(f, "SubscribeIndication[{} on {}]", characteristic, service)
                }
                SubscribeOp::Unsubscribe => {
                    write!(f, "Unsubscribe[{} on {}]", characteristic, service)
                }
            },
            CommandKind::Custom { inner } => write!(f, "Custom[{:?}]", inner.target()),
        }
    }
}

fn lookup_failure(
    link: &Arc<dyn GattLink>,
    service: Uuid,
    characteristic: Uuid,
) -> Option<CommandResult> {
    if !link.has_service(service) {
        error!("could not find service {}", service);
        return Some(CommandResult::error(
            Some(characteristic),
            CommandStatus::ServiceNotFound,
        ));
    }
    if !link.has_characteristic(service, characteristic) {
        error!("could not find characteristic {}", characteristic);
        return Some(CommandResult::error(
            Some(characteristic),
            CommandStatus::CharacteristicNotFound,
        ));
    }
    None
}

async fn run_read(
    service: Uuid,
    characteristic: Uuid,
    ctx: &mut CommandContext<'_>,
) -> CommandResult {
    if let Some(failure) = lookup_failure(ctx.link, service, characteristic) {
        return failure;
    }
    debug!("reading characteristic {}", characteristic);
    if let Err(e) = ctx.link.read_characteristic(service, characteristic) {
        debug!("read request on {} failed: {}", characteristic, e);
        return CommandResult::error(
            Some(characteristic),
            CommandStatus::Failure(GattStatus::FAILURE),
        );
    }
    loop {
        match ctx.events.next().await {
            CommandEvent::Gatt(GattEvent::CharacteristicRead {
                characteristic: uuid,
                value,
                status,
            }) => {
                if uuid != characteristic {
                    error!("got a read result for an unexpected characteristic {}", uuid);
                    continue;
                }
                let result = CommandResult::read(characteristic, value, status);
                debug!("read finished: {}", result);
                return result;
            }
            CommandEvent::ConnectionLost { status } => {
                return CommandResult::error(Some(characteristic), status);
            }
            CommandEvent::Gatt(_) => continue,
        }
    }
}

/// Wait for the acknowledgement of the chunk just written.
async fn await_write_ack(
    characteristic: Uuid,
    events: &mut CommandEvents<'_>,
) -> std::result::Result<(), CommandStatus> {
    loop {
        match events.next().await {
            CommandEvent::Gatt(GattEvent::CharacteristicWrite {
                characteristic: uuid,
                status,
            }) => {
                if uuid != characteristic {
                    error!(
                        "got a write result for an unexpected characteristic {}",
                        uuid
                    );
                    continue;
                }
                if status.is_success() {
                    return Ok(());
                }
                warn!("write on {} failed with status {}", characteristic, status);
                return Err(CommandStatus::Failure(status));
            }
            CommandEvent::ConnectionLost { status } => return Err(status),
            CommandEvent::Gatt(_) => continue,
        }
    }
}

async fn run_write(
    service: Uuid,
    characteristic: Uuid,
    write_type: WriteType,
    source: &Arc<Mutex<Box<dyn InputSource>>>,
    ctx: &mut CommandContext<'_>,
) -> CommandResult {
    if let Some(failure) = lookup_failure(ctx.link, service, characteristic) {
        return failure;
    }
    let blocking = match source.lock() {
        Ok(source) => source.is_blocking(),
        Err(_) => {
            return CommandResult::error(
                Some(characteristic),
                CommandStatus::Failure(GattStatus::FAILURE),
            )
        }
    };
    let result = if blocking {
        run_write_blocking(service, characteristic, write_type, source, ctx).await
    } else {
        run_write_inline(service, characteristic, write_type, source, ctx).await
    };
    debug!("writing finished on {}", characteristic);
    result
}

async fn run_write_inline(
    service: Uuid,
    characteristic: Uuid,
    write_type: WriteType,
    source: &Arc<Mutex<Box<dyn InputSource>>>,
    ctx: &mut CommandContext<'_>,
) -> CommandResult {
    let fail = |status| CommandResult::error(Some(characteristic), status);

    if let Err(e) = source.lock().unwrap().open() {
        warn!("failed to open the write source: {}", e);
        return fail(CommandStatus::Failure(GattStatus::FAILURE));
    }
    let result = loop {
        let chunk = source.lock().unwrap().next_chunk();
        match chunk {
            Err(e) => {
                warn!("failed to get the next chunk: {}", e);
                break fail(CommandStatus::Failure(GattStatus::FAILURE));
            }
            Ok(None) => break CommandResult::empty_success(characteristic),
            Ok(Some(chunk)) => {
                debug!("writing {} bytes onto {}", chunk.len(), characteristic);
                if ctx
                    .link
                    .write_characteristic(service, characteristic, &chunk, write_type)
                    .is_err()
                {
                    break fail(CommandStatus::Failure(GattStatus::FAILURE));
                }
                if let Err(status) = await_write_ack(characteristic, &mut ctx.events).await {
                    break fail(status);
                }
            }
        }
    };
    source.lock().unwrap().close();
    result
}

/// Pump a blocking source on its own task. Each chunk is pulled only after
/// the previous write was acknowledged: the demand channel is the
/// rendezvous that used to be a reader thread with wait/notify.
async fn run_write_blocking(
    service: Uuid,
    characteristic: Uuid,
    write_type: WriteType,
    source: &Arc<Mutex<Box<dyn InputSource>>>,
    ctx: &mut CommandContext<'_>,
) -> CommandResult {
    let fail = |status| CommandResult::error(Some(characteristic), status);

    let (demand_tx, mut demand_rx) = mpsc::channel::<()>(1);
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<std::io::Result<Option<Vec<u8>>>>(1);
    let producer_source = Arc::clone(source);
    tokio::task::spawn_blocking(move || {
        let mut source = match producer_source.lock() {
            Ok(source) => source,
            Err(_) => return,
        };
        if let Err(e) = source.open() {
            let _ = chunk_tx.blocking_send(Err(e));
            return;
        }
        while demand_rx.blocking_recv().is_some() {
            let chunk = source.next_chunk();
            let done = !matches!(chunk, Ok(Some(_)));
            if chunk_tx.blocking_send(chunk).is_err() || done {
                break;
            }
        }
        source.close();
    });

    loop {
        if demand_tx.send(()).await.is_err() {
            break fail(CommandStatus::Failure(GattStatus::FAILURE));
        }
        match chunk_rx.recv().await {
            None => break fail(CommandStatus::Failure(GattStatus::FAILURE)),
            Some(Err(e)) => {
                warn!("failed to get the next chunk: {}", e);
                break fail(CommandStatus::Failure(GattStatus::FAILURE));
            }
            Some(Ok(None)) => break CommandResult::empty_success(characteristic),
            Some(Ok(Some(chunk))) => {
                debug!("writing {} bytes onto {}", chunk.len(), characteristic);
                if ctx
                    .link
                    .write_characteristic(service, characteristic, &chunk, write_type)
                    .is_err()
                {
                    break fail(CommandStatus::Failure(GattStatus::FAILURE));
                }
                if let Err(status) = await_write_ack(characteristic, &mut ctx.events).await {
                    break fail(status);
                }
            }
        }
    }
    // Dropping the channels unblocks the producer, which closes the source.
}

async fn run_subscribe(
    service: Uuid,
    characteristic: Uuid,
    op: SubscribeOp,
    ctx: &mut CommandContext<'_>,
) -> CommandResult {
    if op == SubscribeOp::Unsubscribe && ctx.connection.change_listener_count(characteristic) > 0 {
        debug!(
            "won't unsubscribe on {}: other listeners are registered",
            characteristic
        );
        return CommandResult::empty_success(characteristic);
    }
    if let Some(failure) = lookup_failure(ctx.link, service, characteristic) {
        return failure;
    }
    if !ctx
        .link
        .has_descriptor(service, characteristic, CLIENT_CHARACTERISTIC_CONFIG)
    {
        return CommandResult::error(Some(characteristic), CommandStatus::DescriptorNotFound);
    }

    let (value, enable): (&[u8], bool) = match op {
        SubscribeOp::Notification => {
            debug!("subscribing to notifications on {}", characteristic);
            (&ENABLE_NOTIFICATION_VALUE, true)
        }
        SubscribeOp::Indication => {
            debug!("subscribing to indications on {}", characteristic);
            (&ENABLE_INDICATION_VALUE, true)
        }
        SubscribeOp::Unsubscribe => {
            debug!(
                "unsubscribing from notifications/indications on {}",
                characteristic
            );
            (&DISABLE_NOTIFICATION_VALUE, false)
        }
    };

    let current = ctx
        .link
        .descriptor_value(service, characteristic, CLIENT_CHARACTERISTIC_CONFIG);
    if current.as_deref() == Some(value) {
        debug!("no subscription change needed on {}", characteristic);
        return CommandResult::empty_success(characteristic);
    }

    if ctx
        .link
        .set_characteristic_notification(service, characteristic, enable)
        .is_err()
    {
        error!(
            "failed to change the notification flag on {}",
            characteristic
        );
        return CommandResult::error(
            Some(characteristic),
            CommandStatus::Failure(GattStatus::FAILURE),
        );
    }
    debug!("writing notification config descriptor on {}", characteristic);
    if ctx
        .link
        .write_descriptor(service, characteristic, CLIENT_CHARACTERISTIC_CONFIG, value)
        .is_err()
    {
        error!("failed to write the descriptor on {}", characteristic);
        return CommandResult::error(
            Some(characteristic),
            CommandStatus::Failure(GattStatus::FAILURE),
        );
    }

    loop {
        match ctx.events.next().await {
            CommandEvent::Gatt(GattEvent::DescriptorWrite {
                characteristic: uuid,
                descriptor,
                status,
            }) => {
                if uuid != characteristic || descriptor != CLIENT_CHARACTERISTIC_CONFIG {
                    continue;
                }
                if status.is_success() {
                    return CommandResult::empty_success(characteristic);
                }
                return CommandResult::error(
                    Some(characteristic),
                    CommandStatus::Failure(status),
                );
            }
            CommandEvent::ConnectionLost { status } => {
                return CommandResult::error(Some(characteristic), status);
            }
            CommandEvent::Gatt(_) => continue,
        }
    }
}
