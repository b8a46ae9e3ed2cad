//! The operation engine: an ordered command sequence with retry.
//!
//! An [`Operation`] drives its commands one at a time through the device's
//! [`crate::connection::Connection`], aggregates their results, and re-runs
//! the whole sequence from the start when a command fails and the retry
//! bound allows another attempt. Completion is reported both through the
//! returned [`OperationResults`] and, when registered, an
//! [`OperationObserver`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::command::{Command, CommandContext, CommandEvents, CommandResult, CommandStatus};
use crate::connection::{Connection, OperationToken, TokenEvent};
use crate::registry::Central;
use crate::source::InputSource;
use crate::types::{Address, GattError, GattStatus, Result};

/// Aggregated outcome of one operation run: the last result recorded for
/// each characteristic, plus an overall success flag seeded by the first
/// recorded result.
#[derive(Debug, Clone)]
pub struct OperationResults {
    address: Address,
    results: HashMap<Uuid, CommandResult>,
    success: Option<bool>,
}

impl OperationResults {
    pub(crate) fn new(address: Address) -> Self {
        Self {
            address,
            results: HashMap::new(),
            success: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether every recorded result succeeded. An operation that recorded
    /// nothing (zero commands) is vacuously successful.
    pub fn was_successful(&self) -> bool {
        self.success.unwrap_or(true)
    }

    pub fn result(&self, characteristic: Uuid) -> Option<&CommandResult> {
        self.results.get(&characteristic)
    }

    /// Convenience accessor for a UTF-8 string value.
    pub fn string_value(&self, characteristic: Uuid) -> Option<&str> {
        self.result(characteristic).and_then(CommandResult::value_as_str)
    }

    pub(crate) fn record(&mut self, result: CommandResult) {
        self.success = Some(match self.success {
            None => result.successful(),
            Some(success) => success && result.successful(),
        });
        if let Some(characteristic) = result.characteristic() {
            self.results.insert(characteristic, result);
        }
    }
}

/// Observer of operation progress. Methods default to no-ops.
pub trait OperationObserver: Send + Sync {
    fn on_command_started(&self, operation: &Operation, characteristic: Option<Uuid>) {
        let _ = (operation, characteristic);
    }

    fn on_command_success(&self, operation: &Operation, result: &CommandResult) {
        let _ = (operation, result);
    }

    fn on_command_error(
        &self,
        operation: &Operation,
        characteristic: Option<Uuid>,
        status: CommandStatus,
    ) {
        let _ = (operation, characteristic, status);
    }

    /// Called exactly once per `execute`, unless the operation was
    /// cancelled.
    fn on_operation_finished(&self, operation: &Operation, results: &OperationResults) {
        let _ = (operation, results);
    }
}

/// Builds an [`Operation`] against one device.
pub struct OperationBuilder {
    central: Arc<Central>,
    address: Address,
    commands: Vec<Command>,
    retry_count: i32,
    observer: Option<Arc<dyn OperationObserver>>,
}

impl OperationBuilder {
    pub(crate) fn new(central: Arc<Central>, address: Address) -> Self {
        Self {
            central,
            address,
            commands: Vec::new(),
            retry_count: 0,
            observer: None,
        }
    }

    /// Read a characteristic.
    pub fn read(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.commands.push(Command::read(service, characteristic));
        self
    }

    /// Write a payload to a characteristic, chunk by chunk.
    pub fn write(
        mut self,
        service: Uuid,
        characteristic: Uuid,
        source: Box<dyn InputSource>,
    ) -> Self {
        self.commands.push(Command::write(service, characteristic, source));
        self
    }

    /// Write without waiting for remote acknowledgements.
    pub fn write_no_response(
        mut self,
        service: Uuid,
        characteristic: Uuid,
        source: Box<dyn InputSource>,
    ) -> Self {
        self.commands
            .push(Command::write_no_response(service, characteristic, source));
        self
    }

    /// Enable notifications on a characteristic.
    pub fn subscribe(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.commands.push(Command::subscribe(service, characteristic));
        self
    }

    /// Enable indications on a characteristic.
    pub fn subscribe_indication(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.commands
            .push(Command::subscribe_indication(service, characteristic));
        self
    }

    /// Disable notifications, unless other listeners still need them.
    pub fn unsubscribe(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.commands.push(Command::unsubscribe(service, characteristic));
        self
    }

    /// Append a pre-built command; the way in for custom commands and
    /// per-command observers.
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// How many times the whole sequence is re-run after a failure.
    /// `0` (the default) means a single attempt, `-1` retries until
    /// success or cancellation.
    pub fn retry_count(mut self, count: i32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn OperationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the operation. An operation with no commands is permitted and
    /// completes immediately with a vacuously successful result.
    pub fn build(self) -> Operation {
        Operation {
            central: self.central,
            address: self.address,
            command_count: self.commands.len(),
            commands: tokio::sync::Mutex::new(self.commands),
            retry_count: self.retry_count,
            observer: self.observer,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }
}

enum AttemptEnd {
    Success(OperationResults),
    Failure {
        results: OperationResults,
        last: CommandResult,
    },
    Cancelled,
}

/// An executable, reusable command sequence against one device.
pub struct Operation {
    central: Arc<Central>,
    address: Address,
    commands: tokio::sync::Mutex<Vec<Command>>,
    command_count: usize,
    retry_count: i32,
    observer: Option<Arc<dyn OperationObserver>>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl Operation {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn retry_count(&self) -> i32 {
        self.retry_count
    }

    /// Request cancellation. Takes effect at the next scheduling point of a
    /// running `execute`; the completion observer is not invoked for a
    /// cancelled run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run the command sequence. Command failures are reported through the
    /// returned [`OperationResults`], not as errors; `Err` is reserved for
    /// re-entry ([`GattError::OperationRunning`]) and cancellation
    /// ([`GattError::Cancelled`]). Safe to call again after completion.
    pub async fn execute(&self) -> Result<OperationResults> {
        let mut commands = self
            .commands
            .try_lock()
            .map_err(|_| GattError::OperationRunning)?;
        self.cancelled.store(false, Ordering::SeqCst);

        if commands.is_empty() {
            let results = OperationResults::new(self.address);
            if let Some(observer) = &self.observer {
                observer.on_operation_finished(self, &results);
            }
            return Ok(results);
        }

        let connection = self.central.connection(self.address);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = OperationToken::new(tx);
        let mut retried = 0i32;

        debug!("executing {} on {}", self, self.address);
        loop {
            match self
                .run_attempt(&connection, &mut commands, &mut rx, &token)
                .await
            {
                AttemptEnd::Success(results) => {
                    connection.execute_finished(token.id());
                    debug!("operation finished, success: {}", results.was_successful());
                    if let Some(observer) = &self.observer {
                        observer.on_operation_finished(self, &results);
                    }
                    return Ok(results);
                }
                AttemptEnd::Cancelled => {
                    connection.execute_finished(token.id());
                    debug!("operation cancelled on {}", self.address);
                    return Err(GattError::Cancelled);
                }
                AttemptEnd::Failure { results, last } => {
                    let retryable = last.status() != CommandStatus::AdapterDisabled;
                    if retryable && (self.retry_count == -1 || retried + 1 <= self.retry_count) {
                        retried += 1;
                        info!("retrying operation, attempt {}", retried);
                        continue;
                    }
                    info!("command failed, aborting operation: {}", last.status());
                    connection.execute_finished(token.id());
                    if let Some(observer) = &self.observer {
                        observer.on_operation_finished(self, &results);
                    }
                    return Ok(results);
                }
            }
        }
    }

    /// One pass over the whole sequence: acquire the link, run every
    /// command in order, stop at the first failure.
    async fn run_attempt(
        &self,
        connection: &Arc<Connection>,
        commands: &mut [Command],
        rx: &mut mpsc::UnboundedReceiver<TokenEvent>,
        token: &OperationToken,
    ) -> AttemptEnd {
        // anything still buffered belongs to the previous attempt
        while rx.try_recv().is_ok() {}

        let mut results = OperationResults::new(self.address);
        connection.execute(token.clone());

        let link = loop {
            tokio::select! {
                _ = self.cancelled_wait() => return AttemptEnd::Cancelled,
                event = rx.recv() => match event {
                    Some(TokenEvent::Ready { link }) => break link,
                    Some(TokenEvent::ConnectionLost { status }) => {
                        let failure = CommandResult::error(None, status);
                        results.record(failure.clone());
                        return AttemptEnd::Failure { results, last: failure };
                    }
                    Some(TokenEvent::Gatt(_)) => continue,
                    None => {
                        let failure = CommandResult::error(
                            None,
                            CommandStatus::Failure(GattStatus::FAILURE),
                        );
                        results.record(failure.clone());
                        return AttemptEnd::Failure { results, last: failure };
                    }
                }
            }
        };

        for command in commands.iter_mut() {
            // the link may have dropped in the gap between two commands
            let mut lost = None;
            while let Ok(event) = rx.try_recv() {
                if let TokenEvent::ConnectionLost { status } = event {
                    lost = Some(status);
                    break;
                }
            }
            if let Some(status) = lost {
                let failure = CommandResult::error(None, status);
                results.record(failure.clone());
                return AttemptEnd::Failure { results, last: failure };
            }
            if self.cancelled.load(Ordering::SeqCst) {
                command.cancel();
                return AttemptEnd::Cancelled;
            }

            if let Some(observer) = &self.observer {
                observer.on_command_started(self, command.target());
            }
            debug!("executing command: {}", command);
            let outcome = {
                let mut ctx = CommandContext {
                    connection,
                    link: &link,
                    events: CommandEvents::new(rx),
                };
                tokio::select! {
                    _ = self.cancelled_wait() => None,
                    result = command.run(&mut ctx) => Some(result),
                }
            };
            let Some(result) = outcome else {
                command.cancel();
                return AttemptEnd::Cancelled;
            };
            debug!("command {} finished: {}", command, result);

            let success = result.successful();
            results.record(result.clone());
            if let Some(observer) = command.observer() {
                observer.on_command_finished(&result);
            }
            if let Some(observer) = &self.observer {
                if success {
                    observer.on_command_success(self, &result);
                } else {
                    observer.on_command_error(self, command.target(), result.status());
                }
            }
            if !success {
                return AttemptEnd::Failure {
                    results,
                    last: result,
                };
            }
        }
        AttemptEnd::Success(results)
    }

    async fn cancelled_wait(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation[retry_count: {}, commands: {}]",
            self.retry_count, self.command_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdapter, MockPeripheral, MockRequest};
    use crate::platform::CLIENT_CHARACTERISTIC_CONFIG;
    use crate::source::{BytesInputSource, ChannelInputSource};
    use crate::types::GattStatus;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const SERVICE: Uuid = Uuid::from_u128(0x1000);
    const CHAR_A: Uuid = Uuid::from_u128(0x2001);
    const CHAR_B: Uuid = Uuid::from_u128(0x2002);

    fn addr() -> Address {
        Address::new([0xA, 1, 2, 3, 4, 5])
    }

    fn setup() -> (Arc<MockPeripheral>, Arc<Central>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR_A, b"alpha".to_vec());
        peripheral.add_characteristic(SERVICE, CHAR_B, b"beta".to_vec());
        let central = Central::new(adapter);
        (peripheral, central)
    }

    fn read_requests(peripheral: &MockPeripheral) -> Vec<Uuid> {
        peripheral
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                MockRequest::Read(uuid) => Some(uuid),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_read_returns_value() {
        let (_peripheral, central) = setup();
        let operation = central.operation(addr()).read(SERVICE, CHAR_A).build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        assert_eq!(results.string_value(CHAR_A), Some("alpha"));
    }

    #[tokio::test]
    async fn test_missing_service_fails_without_platform_call() {
        let (peripheral, central) = setup();
        let operation = central
            .operation(addr())
            .read(Uuid::from_u128(0xDEAD), CHAR_A)
            .build();
        let results = operation.execute().await.unwrap();
        assert!(!results.was_successful());
        assert_eq!(
            results.result(CHAR_A).unwrap().status(),
            CommandStatus::ServiceNotFound
        );
        assert!(read_requests(&peripheral).is_empty());
    }

    #[tokio::test]
    async fn test_retry_reruns_whole_sequence() {
        // two reads, the second fails once, retry_count = 1
        let (peripheral, central) = setup();
        peripheral.fail_next_read(CHAR_B, GattStatus::ERROR);
        let operation = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .read(SERVICE, CHAR_B)
            .retry_count(1)
            .build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        assert_eq!(results.string_value(CHAR_A), Some("alpha"));
        assert_eq!(results.string_value(CHAR_B), Some("beta"));
        // both reads re-ran from the start
        assert_eq!(read_requests(&peripheral), vec![CHAR_A, CHAR_B, CHAR_A, CHAR_B]);
    }

    #[tokio::test]
    async fn test_retry_count_zero_is_single_attempt() {
        let (peripheral, central) = setup();
        peripheral.fail_next_read(CHAR_A, GattStatus::ERROR);
        let operation = central.operation(addr()).read(SERVICE, CHAR_A).build();
        let results = operation.execute().await.unwrap();
        assert!(!results.was_successful());
        assert_eq!(
            results.result(CHAR_A).unwrap().status(),
            CommandStatus::Failure(GattStatus::ERROR)
        );
        assert_eq!(read_requests(&peripheral), vec![CHAR_A]);
    }

    #[tokio::test]
    async fn test_retry_bound_exhausted() {
        let (peripheral, central) = setup();
        peripheral.fail_next_read(CHAR_A, GattStatus::ERROR);
        peripheral.fail_next_read(CHAR_A, GattStatus::ERROR);
        peripheral.fail_next_read(CHAR_A, GattStatus::ERROR);
        let operation = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .retry_count(2)
            .build();
        let results = operation.execute().await.unwrap();
        // three attempts total, all failed
        assert!(!results.was_successful());
        assert_eq!(read_requests(&peripheral).len(), 3);
    }

    #[tokio::test]
    async fn test_unlimited_retry_until_success() {
        let (peripheral, central) = setup();
        peripheral.fail_next_read(CHAR_A, GattStatus::ERROR);
        peripheral.fail_next_read(CHAR_A, GattStatus::ERROR);
        let operation = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .retry_count(-1)
            .build();
        let results = timeout(Duration::from_secs(5), operation.execute())
            .await
            .expect("unlimited retry did not converge")
            .unwrap();
        assert!(results.was_successful());
        assert_eq!(read_requests(&peripheral).len(), 3);
    }

    #[tokio::test]
    async fn test_retry_after_connection_failure() {
        let (peripheral, central) = setup();
        peripheral.fail_next_connect(GattStatus::ERROR);
        let operation = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .retry_count(1)
            .build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        assert_eq!(results.string_value(CHAR_A), Some("alpha"));
    }

    #[tokio::test]
    async fn test_adapter_disabled_is_not_retried() {
        let adapter = MockAdapter::new();
        adapter.peripheral(addr());
        adapter.set_enabled(false);
        let central = Central::new(adapter);
        let operation = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .retry_count(-1)
            .build();
        // unlimited retry must still terminate: adapter-off is not retryable
        let results = timeout(Duration::from_secs(2), operation.execute())
            .await
            .expect("adapter-off failure kept retrying")
            .unwrap();
        assert!(!results.was_successful());
    }

    #[tokio::test]
    async fn test_zero_commands_vacuously_successful() {
        let (peripheral, central) = setup();
        let operation = central.operation(addr()).build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        assert!(peripheral.requests().is_empty());
    }

    #[tokio::test]
    async fn test_results_seeded_by_first_failure() {
        let (peripheral, central) = setup();
        peripheral.fail_next_read(CHAR_A, GattStatus::ERROR);
        let operation = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .read(SERVICE, CHAR_B)
            .build();
        let results = operation.execute().await.unwrap();
        assert!(!results.was_successful());
        // the sequence stopped at the failure
        assert!(results.result(CHAR_B).is_none());
    }

    #[tokio::test]
    async fn test_write_chunks_payload() {
        let (peripheral, central) = setup();
        let operation = central
            .operation(addr())
            .write(SERVICE, CHAR_A, Box::new(BytesInputSource::new(vec![0x55; 45])))
            .build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        let written = peripheral.written(CHAR_A);
        assert_eq!(
            written.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![20, 20, 5]
        );
    }

    #[tokio::test]
    async fn test_write_from_blocking_source() {
        let (peripheral, central) = setup();
        let (tx, source) = ChannelInputSource::new();
        let producer = std::thread::spawn(move || {
            tx.send(vec![1; 10]).unwrap();
            tx.send(vec![2; 10]).unwrap();
        });
        let operation = central
            .operation(addr())
            .write(SERVICE, CHAR_A, Box::new(source))
            .build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        producer.join().unwrap();
        assert_eq!(peripheral.written(CHAR_A), vec![vec![1; 10], vec![2; 10]]);
    }

    #[tokio::test]
    async fn test_subscribe_writes_cccd() {
        let (peripheral, central) = setup();
        let operation = central.operation(addr()).subscribe(SERVICE, CHAR_A).build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        assert!(peripheral.notifying(SERVICE, CHAR_A));
        assert_eq!(
            peripheral.descriptor(SERVICE, CHAR_A, CLIENT_CHARACTERISTIC_CONFIG),
            Some(vec![0x01, 0x00])
        );
    }

    #[tokio::test]
    async fn test_subscribe_skips_write_when_already_set() {
        let (peripheral, central) = setup();
        peripheral.set_descriptor(SERVICE, CHAR_A, CLIENT_CHARACTERISTIC_CONFIG, vec![0x01, 0x00]);
        let operation = central.operation(addr()).subscribe(SERVICE, CHAR_A).build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        let descriptor_writes = peripheral
            .requests()
            .iter()
            .filter(|r| matches!(r, MockRequest::DescriptorWrite(..)))
            .count();
        assert_eq!(descriptor_writes, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_guarded_by_other_listeners() {
        let (peripheral, central) = setup();
        peripheral.set_descriptor(SERVICE, CHAR_A, CLIENT_CHARACTERISTIC_CONFIG, vec![0x01, 0x00]);
        let connection = central.connection(addr());
        connection.add_change_listener(CHAR_A, Arc::new(|_: &CommandResult| {}));

        let operation = central.operation(addr()).unsubscribe(SERVICE, CHAR_A).build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        // nothing was written: the other listener keeps the subscription
        assert_eq!(
            peripheral.descriptor(SERVICE, CHAR_A, CLIENT_CHARACTERISTIC_CONFIG),
            Some(vec![0x01, 0x00])
        );
        let descriptor_writes = peripheral
            .requests()
            .iter()
            .filter(|r| matches!(r, MockRequest::DescriptorWrite(..)))
            .count();
        assert_eq!(descriptor_writes, 0);
    }

    #[tokio::test]
    async fn test_reentry_rejected() {
        let (peripheral, central) = setup();
        peripheral.set_response_delay(Duration::from_millis(100));
        let operation = Arc::new(central.operation(addr()).read(SERVICE, CHAR_A).build());
        let running = Arc::clone(&operation);
        let task = tokio::spawn(async move { running.execute().await });
        sleep(Duration::from_millis(20)).await;
        match operation.execute().await {
            Err(GattError::OperationRunning) => {}
            other => panic!("expected OperationRunning, got {:?}", other.map(|r| r.was_successful())),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_suppresses_observer() {
        struct Probe(AtomicUsize);
        impl OperationObserver for Probe {
            fn on_operation_finished(&self, _op: &Operation, _results: &OperationResults) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (peripheral, central) = setup();
        peripheral.set_response_delay(Duration::from_millis(200));
        let probe = Arc::new(Probe(AtomicUsize::new(0)));
        let operation = Arc::new(
            central
                .operation(addr())
                .read(SERVICE, CHAR_A)
                .observer(probe.clone())
                .build(),
        );
        let running = Arc::clone(&operation);
        let task = tokio::spawn(async move { running.execute().await });
        sleep(Duration::from_millis(20)).await;
        operation.cancel();
        match task.await.unwrap() {
            Err(GattError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other.map(|r| r.was_successful())),
        }
        sleep(Duration::from_millis(250)).await;
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_operation_is_reusable() {
        let (peripheral, central) = setup();
        let operation = central.operation(addr()).read(SERVICE, CHAR_A).build();
        assert!(operation.execute().await.unwrap().was_successful());
        assert!(operation.execute().await.unwrap().was_successful());
        assert_eq!(read_requests(&peripheral).len(), 2);
    }

    #[tokio::test]
    async fn test_observer_callbacks_on_success() {
        #[derive(Default)]
        struct Probe {
            started: AtomicUsize,
            succeeded: AtomicUsize,
            finished: AtomicUsize,
        }
        impl OperationObserver for Probe {
            fn on_command_started(&self, _op: &Operation, _c: Option<Uuid>) {
                self.started.fetch_add(1, Ordering::SeqCst);
            }
            fn on_command_success(&self, _op: &Operation, _r: &CommandResult) {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            fn on_operation_finished(&self, _op: &Operation, _r: &OperationResults) {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_peripheral, central) = setup();
        let probe = Arc::new(Probe::default());
        let operation = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .read(SERVICE, CHAR_B)
            .observer(probe.clone())
            .build();
        let results = operation.execute().await.unwrap();
        assert!(results.was_successful());
        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
        assert_eq!(probe.succeeded.load(Ordering::SeqCst), 2);
        assert_eq!(probe.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_command_in_flight_across_operations() {
        let (peripheral, central) = setup();
        peripheral.set_response_delay(Duration::from_millis(5));
        let op1 = central
            .operation(addr())
            .read(SERVICE, CHAR_A)
            .read(SERVICE, CHAR_B)
            .build();
        let op2 = central
            .operation(addr())
            .read(SERVICE, CHAR_B)
            .read(SERVICE, CHAR_A)
            .build();
        let (r1, r2) = tokio::join!(op1.execute(), op2.execute());
        assert!(r1.unwrap().was_successful());
        assert!(r2.unwrap().was_successful());
        assert_eq!(peripheral.max_in_flight(), 1);
        assert_eq!(read_requests(&peripheral).len(), 4);
    }

    #[tokio::test]
    async fn test_fifo_order_between_operations() {
        let (peripheral, central) = setup();
        peripheral.set_response_delay(Duration::from_millis(5));
        let op1 = Arc::new(central.operation(addr()).read(SERVICE, CHAR_A).build());
        let op2 = Arc::new(central.operation(addr()).read(SERVICE, CHAR_B).build());
        let first = Arc::clone(&op1);
        let t1 = tokio::spawn(async move { first.execute().await });
        sleep(Duration::from_millis(10)).await;
        let second = Arc::clone(&op2);
        let t2 = tokio::spawn(async move { second.execute().await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();
        assert_eq!(read_requests(&peripheral), vec![CHAR_A, CHAR_B]);
    }
}
