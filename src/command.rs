//! Send a command and watch for its matching response.
//!
//! A [`WatchdogCommand`] couples an outgoing line with the response line that
//! acknowledges it. Invoking the command writes the line to the transport
//! and, unless told otherwise, runs a [`ResponseWaiter`] on a bounded worker
//! so the wait can be cancelled from the link-loss signal while the caller
//! stays blocked. Each instance serializes its own invocations: a second
//! call blocks until the prior one has completed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tracing::debug;

use crate::catalog::CommandSpec;
use crate::dispatch::Handler;
use crate::error::{LinkError, LinkResult};
use crate::exchange::{Disconnect, MessageExchange, Transport};
use crate::waiter::{timeout_from_secs, ResponseWaiter, WaitOutcome};
use crate::worker::{TaskHandle, Worker};

/// Typed result of a send-and-wait invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The expected response arrived before the timeout.
    Acknowledged,
    /// The timeout elapsed without the expected response.
    TimedOut,
    /// The wait was cancelled by link loss or shutdown.
    Cancelled,
}

/// State shared with the worker job and the link-loss handler.
struct CommandInner {
    transport: Arc<dyn Transport>,
    outgoing: Mutex<Option<String>>,
    waiter: ResponseWaiter,
    /// Handle of the in-flight wait; guarded access serializes invocations.
    pending: Mutex<Option<TaskHandle<WaitOutcome>>>,
    exchange: MessageExchange,
    loss_handler: OnceLock<Handler<Disconnect>>,
    detached: AtomicBool,
}

impl CommandInner {
    /// Cancel any blocked wait and detach from the link-loss signal once.
    fn shutdown(&self) {
        self.waiter.cancel();
        if !self.detached.swap(true, Ordering::SeqCst) {
            if let Some(handler) = self.loss_handler.get() {
                self.exchange.link_lost().unsubscribe(handler);
            }
            debug!(expected = %self.waiter.expected(), "command shut down");
        }
    }
}

/// Send-then-wait command with watchdog cancellation.
pub struct WatchdogCommand {
    inner: Arc<CommandInner>,
    worker: Arc<Worker>,
    timeout: Option<Duration>,
}

impl WatchdogCommand {
    /// Create a command waiting for `expected`, with its own worker.
    ///
    /// The command subscribes its shutdown to the exchange's link-loss
    /// dispatcher, so a dropped connection cancels any outstanding wait.
    pub fn new(
        transport: Arc<dyn Transport>,
        exchange: &MessageExchange,
        expected: impl Into<String>,
    ) -> LinkResult<Self> {
        Self::with_worker(transport, exchange, expected, Arc::new(Worker::new()))
    }

    /// Create a command sharing a worker with other commands.
    pub fn with_worker(
        transport: Arc<dyn Transport>,
        exchange: &MessageExchange,
        expected: impl Into<String>,
        worker: Arc<Worker>,
    ) -> LinkResult<Self> {
        let waiter = ResponseWaiter::new(Arc::clone(exchange.receive()), expected)?;
        let inner = Arc::new(CommandInner {
            transport,
            outgoing: Mutex::new(None),
            waiter,
            pending: Mutex::new(None),
            exchange: exchange.clone(),
            loss_handler: OnceLock::new(),
            detached: AtomicBool::new(false),
        });

        // The handler holds a weak reference so a dropped command does not
        // keep itself alive through the dispatcher.
        let weak = Arc::downgrade(&inner);
        let handler: Handler<Disconnect> = Arc::new(move |_bound, event: &Disconnect| {
            if let Some(inner) = weak.upgrade() {
                debug!(cause = ?event.cause, "link loss, cancelling command wait");
                inner.shutdown();
            }
            Ok(())
        });
        let _ = inner.loss_handler.set(Arc::clone(&handler));
        exchange.link_lost().subscribe(handler);

        Ok(WatchdogCommand {
            inner,
            worker,
            timeout: None,
        })
    }

    /// Build a command from a catalog entry.
    pub fn from_spec(
        transport: Arc<dyn Transport>,
        exchange: &MessageExchange,
        spec: &CommandSpec,
    ) -> LinkResult<Self> {
        let mut command =
            Self::new(transport, exchange, spec.expected.clone())?.with_outgoing(&spec.outgoing);
        if let Some(secs) = spec.timeout_secs {
            command = command.with_timeout(timeout_from_secs(secs)?);
        }
        Ok(command)
    }

    /// Set the outgoing text at construction.
    pub fn with_outgoing(self, outgoing: impl Into<String>) -> Self {
        self.set_outgoing(outgoing);
        self
    }

    /// Set the instance default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the instance default timeout from a seconds value, validating it.
    pub fn with_timeout_secs(self, secs: f64) -> LinkResult<Self> {
        Ok(self.with_timeout(timeout_from_secs(secs)?))
    }

    /// Replace the outgoing text for subsequent invocations.
    pub fn set_outgoing(&self, outgoing: impl Into<String>) {
        *self.inner.outgoing.lock().unwrap() = Some(outgoing.into());
    }

    /// The configured outgoing text, if any.
    pub fn outgoing(&self) -> Option<String> {
        self.inner.outgoing.lock().unwrap().clone()
    }

    /// The response line this command waits for.
    pub fn expected(&self) -> &str {
        self.inner.waiter.expected()
    }

    /// Send the configured command and optionally wait for its response.
    ///
    /// The send happens unconditionally before any waiting. With
    /// `wait == false` the call returns `Ok(None)` immediately after the
    /// write; otherwise it blocks until the wait resolves and reports the
    /// [`CommandOutcome`]. A concurrent invocation on the same instance
    /// blocks until the prior one completes.
    pub fn invoke(&self, wait: bool, timeout: Option<Duration>) -> LinkResult<Option<CommandOutcome>> {
        let pending = self.inner.pending.lock().unwrap();
        self.invoke_locked(pending, None, wait, timeout)
    }

    /// [`WatchdogCommand::invoke`] with a per-call outgoing override.
    pub fn invoke_with(
        &self,
        outgoing: Option<&str>,
        wait: bool,
        timeout: Option<Duration>,
    ) -> LinkResult<Option<CommandOutcome>> {
        let pending = self.inner.pending.lock().unwrap();
        self.invoke_locked(pending, outgoing, wait, timeout)
    }

    /// Non-blocking serialization policy: signals
    /// [`LinkError::CommandInProgress`] instead of blocking when the prior
    /// invocation has not completed.
    pub fn try_invoke(
        &self,
        wait: bool,
        timeout: Option<Duration>,
    ) -> LinkResult<Option<CommandOutcome>> {
        let pending = self
            .inner
            .pending
            .try_lock()
            .map_err(|_| LinkError::CommandInProgress)?;
        if pending.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(LinkError::CommandInProgress);
        }
        self.invoke_locked(pending, None, wait, timeout)
    }

    fn invoke_locked(
        &self,
        mut pending: MutexGuard<'_, Option<TaskHandle<WaitOutcome>>>,
        outgoing: Option<&str>,
        wait: bool,
        timeout: Option<Duration>,
    ) -> LinkResult<Option<CommandOutcome>> {
        if !wait {
            self.send_locked(&mut pending, outgoing)?;
            return Ok(None);
        }
        self.wait_locked(pending, outgoing, timeout).map(Some)
    }

    /// Resolve the outgoing line, drain a stale handle so a fresh call always
    /// starts clean, and write the line to the transport.
    fn send_locked(
        &self,
        pending: &mut Option<TaskHandle<WaitOutcome>>,
        outgoing: Option<&str>,
    ) -> LinkResult<String> {
        let line = match outgoing {
            Some(text) => text.to_string(),
            None => self
                .inner
                .outgoing
                .lock()
                .unwrap()
                .clone()
                .ok_or(LinkError::MissingCommand)?,
        };

        if let Some(previous) = pending.take() {
            if !previous.is_finished() {
                debug!(command = %line, "waiting for prior invocation to settle");
                let _ = previous.wait();
            }
        }

        debug!(command = %line, "sending");
        self.inner.transport.send(&line)?;
        Ok(line)
    }

    /// Send, then block until the acknowledgement wait resolves. The guard is
    /// dropped once the handle is cached, so cancellation and the next caller
    /// can proceed while this thread blocks.
    fn wait_locked(
        &self,
        mut pending: MutexGuard<'_, Option<TaskHandle<WaitOutcome>>>,
        outgoing: Option<&str>,
        timeout: Option<Duration>,
    ) -> LinkResult<CommandOutcome> {
        let line = self.send_locked(&mut pending, outgoing)?;

        let effective = timeout.or(self.timeout);
        let inner = Arc::clone(&self.inner);
        let handle = self
            .worker
            .submit(move || inner.waiter.wait_outcome(effective));
        *pending = Some(handle.clone());
        drop(pending);

        let outcome = match handle.wait() {
            Some(WaitOutcome::Satisfied) => CommandOutcome::Acknowledged,
            Some(WaitOutcome::TimedOut) => CommandOutcome::TimedOut,
            Some(WaitOutcome::Cancelled) | None => CommandOutcome::Cancelled,
        };
        debug!(command = %line, ?outcome, "invocation resolved");
        Ok(outcome)
    }

    /// Send without waiting for the response.
    pub fn send_only(&self) -> LinkResult<()> {
        self.invoke(false, None).map(|_| ())
    }

    /// Legacy raising style: send, wait, and signal [`LinkError::Timeout`]
    /// on expiry or [`LinkError::Cancelled`] on link loss.
    pub fn run(&self, timeout: Option<Duration>) -> LinkResult<()> {
        let pending = self.inner.pending.lock().unwrap();
        match self.wait_locked(pending, None, timeout)? {
            CommandOutcome::Acknowledged => Ok(()),
            CommandOutcome::TimedOut => Err(LinkError::Timeout(self.expected().to_string())),
            CommandOutcome::Cancelled => Err(LinkError::Cancelled(self.expected().to_string())),
        }
    }

    /// Boolean style: whether the response was observed before the timeout.
    ///
    /// Timed-out and cancelled waits both report `false`, so teardown
    /// sequences can complete without error handling.
    pub fn run_checked(&self, timeout: Option<Duration>) -> LinkResult<bool> {
        let pending = self.inner.pending.lock().unwrap();
        Ok(self.wait_locked(pending, None, timeout)? == CommandOutcome::Acknowledged)
    }

    /// Wake any blocked wait immediately and detach from the link-loss
    /// signal.
    ///
    /// Safe to call repeatedly and from a different thread than the one
    /// blocked in [`WatchdogCommand::invoke`]. After shutdown, further waits
    /// on this instance resolve as [`CommandOutcome::Cancelled`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for WatchdogCommand {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    use crate::error::TransportError;

    struct MockTransport {
        sent: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(MockTransport {
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send(&self, line: &str) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::NotOpen);
            }
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_missing_outgoing_text() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(transport, &exchange, "connected").unwrap();

        let err = command.invoke(false, None).unwrap_err();
        assert!(matches!(err, LinkError::MissingCommand));
    }

    #[test]
    fn test_send_without_wait_returns_immediately() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "connected")
            .unwrap()
            .with_outgoing("connect");

        let start = Instant::now();
        assert_eq!(command.invoke(false, None).unwrap(), None);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(transport.sent(), vec!["connect".to_string()]);
    }

    #[test]
    fn test_send_and_wait_acknowledged() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "pos_out")
            .unwrap()
            .with_outgoing("move_out")
            .with_timeout(Duration::from_secs(1));

        let emitter = exchange.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            emitter.notify_line("pos_out").unwrap();
        });

        assert_eq!(
            command.invoke(true, None).unwrap(),
            Some(CommandOutcome::Acknowledged)
        );
        assert_eq!(transport.sent(), vec!["move_out".to_string()]);
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_still_sends_exactly_once() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "shutter_opened")
            .unwrap()
            .with_outgoing("open_shutter")
            .with_timeout(Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(
            command.invoke(true, None).unwrap(),
            Some(CommandOutcome::TimedOut)
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
        assert_eq!(transport.sent(), vec!["open_shutter".to_string()]);
    }

    #[test]
    fn test_per_call_timeout_overrides_default() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "never")
            .unwrap()
            .with_outgoing("cmd")
            .with_timeout(Duration::from_secs(30));

        let start = Instant::now();
        assert_eq!(
            command.invoke(true, Some(Duration::from_millis(30))).unwrap(),
            Some(CommandOutcome::TimedOut)
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_outgoing_override_per_call() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "rot_stopped")
            .unwrap()
            .with_outgoing("rot_cw+10");

        command.invoke_with(Some("rot_cw+25"), false, None).unwrap();
        command.invoke(false, None).unwrap();

        assert_eq!(
            transport.sent(),
            vec!["rot_cw+25".to_string(), "rot_cw+10".to_string()]
        );
    }

    #[test]
    fn test_transport_failure_propagates() {
        let transport = MockTransport::new();
        transport.fail.store(true, Ordering::SeqCst);
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "connected")
            .unwrap()
            .with_outgoing("connect");

        let err = command.invoke(true, None).unwrap_err();
        assert!(matches!(err, LinkError::Transport(TransportError::NotOpen)));
    }

    #[test]
    fn test_run_succeeds_only_on_acknowledgement() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "pos_out")
            .unwrap()
            .with_outgoing("move_out")
            .with_timeout(Duration::from_secs(1));

        let emitter = exchange.clone();
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            emitter.notify_line("pos_out").unwrap();
        });

        // run always waits; Ok means the response was actually observed.
        command.run(None).unwrap();
        assert_eq!(transport.sent(), vec!["move_out".to_string()]);
        feeder.join().unwrap();
    }

    #[test]
    fn test_run_styles() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "never")
            .unwrap()
            .with_outgoing("cmd")
            .with_timeout(Duration::from_millis(30));

        assert!(matches!(command.run(None), Err(LinkError::Timeout(_))));
        assert!(!command.run_checked(None).unwrap());
    }

    #[test]
    fn test_shutdown_detaches_loss_subscription_once() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "connected").unwrap();

        assert_eq!(exchange.link_lost().len(), 1);
        command.shutdown();
        assert_eq!(exchange.link_lost().len(), 0);
        command.shutdown();
        assert_eq!(exchange.link_lost().len(), 0);
    }

    #[test]
    fn test_try_invoke_reports_command_in_progress() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = Arc::new(
            WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "pos_out")
                .unwrap()
                .with_outgoing("move_out"),
        );

        let blocked = Arc::clone(&command);
        let caller = thread::spawn(move || blocked.invoke(true, Some(Duration::from_secs(10))));
        thread::sleep(Duration::from_millis(50));

        let err = command.try_invoke(true, None).unwrap_err();
        assert!(matches!(err, LinkError::CommandInProgress));

        command.shutdown();
        assert_eq!(
            caller.join().unwrap().unwrap(),
            Some(CommandOutcome::Cancelled)
        );
    }

    #[test]
    fn test_wait_after_shutdown_is_cancelled() {
        let transport = MockTransport::new();
        let exchange = MessageExchange::new();
        let command = WatchdogCommand::new(Arc::clone(&transport) as Arc<dyn Transport>, &exchange, "connected")
            .unwrap()
            .with_outgoing("connect");

        command.shutdown();

        let start = Instant::now();
        assert_eq!(
            command.invoke(true, Some(Duration::from_secs(10))).unwrap(),
            Some(CommandOutcome::Cancelled)
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
