//! The Dispatcher: a single-threaded, cooperative event loop.
//!
//! The dispatcher owns a table of [`IoHandle`]s. Each iteration it asks every
//! handle whether it is ready, blocks on the [`Reactor`] for at most the poll
//! timeout when nothing is, runs the callbacks of the ready handles and finally
//! drains the bus's cross-thread queue. Handle callbacks may publish
//! synchronously; they always run on the dispatcher thread.
//!
//! A handle whose callback fails or panics is reported as a [`HandleFault`] and,
//! unless it asks to be kept, is closed and removed. The loop itself carries on.

use crate::bus::{panic_message, MessageBus};
use crate::common::HandleId;
use crate::error::{DispatchError, HandleFault};
use crate::events::SystemEvent;
use crate::reactor::{Reactor, Waker};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What a handle is ready for right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        readable: false,
        writable: false,
    };
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };

    pub fn is_ready(&self) -> bool {
        self.readable || self.writable
    }

    fn mask(self, readable: bool, writable: bool) -> Readiness {
        Readiness {
            readable: self.readable && readable,
            writable: self.writable && writable,
        }
    }
}

/// What the dispatcher does with a handle after one of its callbacks faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Deregister,
    Keep,
}

/// A readiness-based I/O source driven by the [`Dispatcher`].
///
/// `poll_ready` must never block. Anything that can make the handle ready from
/// another thread should hold the [`Waker`] passed to `attach` and call it, so
/// the dispatcher does not sit out the full poll timeout.
pub trait IoHandle: Send {
    fn name(&self) -> &str;

    /// Whether the handle is interested in read readiness at the moment.
    fn readable(&self) -> bool {
        true
    }

    /// Whether the handle is interested in write readiness at the moment.
    fn writable(&self) -> bool {
        false
    }

    fn poll_ready(&mut self) -> Readiness;

    fn attach(&mut self, _waker: Waker) {}

    fn handle_read(&mut self, _bus: &MessageBus) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_write(&mut self, _bus: &MessageBus) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the handle leaves the dispatcher, for any reason.
    fn handle_close(&mut self) {}

    fn fault_action(&self) -> FaultAction {
        FaultAction::Deregister
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Constructed, accepting handles, `run` not yet entered.
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on how long an idle iteration blocks before draining.
    pub poll_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// The outcome of one [`Dispatcher::run_once`] iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Handles whose callbacks ran.
    pub ready: usize,
    /// Handles whose callbacks faulted.
    pub faulted: usize,
    /// Cross-thread messages delivered.
    pub drained: usize,
}

struct Shared {
    state: Mutex<DispatcherState>,
}

/// A thread-safe remote control for a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherControl {
    shared: Arc<Shared>,
    waker: Waker,
}

impl DispatcherControl {
    pub fn state(&self) -> DispatcherState {
        *self.shared.state.lock()
    }

    /// Asks the dispatcher to stop after its current iteration.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            match *state {
                DispatcherState::Idle | DispatcherState::Running => {
                    *state = DispatcherState::Stopping;
                }
                DispatcherState::Stopping | DispatcherState::Stopped => return,
            }
        }
        info!("Dispatcher shutdown requested.");
        self.waker.wake();
    }
}

pub struct Dispatcher {
    bus: MessageBus,
    reactor: Reactor,
    config: DispatcherConfig,
    handles: SlotMap<HandleId, Box<dyn IoHandle>>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Creates a dispatcher and binds it to `bus`, so cross-thread publishes
    /// wake it up.
    pub fn new(bus: MessageBus, config: DispatcherConfig) -> Self {
        let reactor = Reactor::new();
        bus.bind_dispatcher(reactor.waker());
        Self {
            bus,
            reactor,
            config,
            handles: SlotMap::with_key(),
            shared: Arc::new(Shared {
                state: Mutex::new(DispatcherState::Idle),
            }),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn waker(&self) -> Waker {
        self.reactor.waker()
    }

    pub fn control(&self) -> DispatcherControl {
        DispatcherControl {
            shared: self.shared.clone(),
            waker: self.reactor.waker(),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.shared.state.lock()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn handle_names(&self) -> Vec<String> {
        self.handles.values().map(|h| h.name().to_string()).collect()
    }

    /// Adds a handle to the table. Refused once shutdown has begun.
    pub fn register(&mut self, mut handle: Box<dyn IoHandle>) -> Result<HandleId, DispatchError> {
        match self.state() {
            DispatcherState::Idle | DispatcherState::Running => {}
            other => return Err(DispatchError::NotAccepting(other)),
        }
        handle.attach(self.reactor.waker());
        let name = handle.name().to_string();
        let id = self.handles.insert(handle);
        debug!(handle = %name, "Registered I/O handle");
        self.announce(SystemEvent::HandleRegistered { name });
        Ok(id)
    }

    /// Closes and removes a handle. Returns `false` if it was already gone.
    pub fn deregister(&mut self, id: HandleId) -> bool {
        self.remove(id, "deregistered")
    }

    fn remove(&mut self, id: HandleId, reason: &str) -> bool {
        match self.handles.remove(id) {
            Some(mut handle) => {
                handle.handle_close();
                let name = handle.name().to_string();
                debug!(handle = %name, reason, "Removed I/O handle");
                self.announce(SystemEvent::HandleRemoved {
                    name,
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn announce(&self, event: SystemEvent) {
        // Before `run` there is no dispatcher thread yet, so queue the event.
        if self.bus.on_dispatch_thread() {
            event.announce(&self.bus);
        } else {
            match event.message() {
                Ok(message) => self.bus.enqueue(message),
                Err(err) => warn!("Could not announce {:?}: {}", event, err),
            }
        }
    }

    fn poll_handles(&mut self) -> Vec<(HandleId, Readiness)> {
        self.handles
            .iter_mut()
            .filter_map(|(id, handle)| {
                let (readable, writable) = (handle.readable(), handle.writable());
                if !readable && !writable {
                    return None;
                }
                let ready = handle.poll_ready().mask(readable, writable);
                ready.is_ready().then_some((id, ready))
            })
            .collect()
    }

    /// Runs a single iteration: wait for readiness, run callbacks, drain.
    pub fn run_once(&mut self) -> IterationReport {
        let mut ready = self.poll_handles();
        if ready.is_empty() && self.bus.pending_len() == 0 && self.state() != DispatcherState::Stopping
        {
            self.reactor.wait(self.config.poll_timeout);
            ready = self.poll_handles();
        }

        let mut report = IterationReport {
            ready: ready.len(),
            ..IterationReport::default()
        };
        for (id, readiness) in ready {
            if let Some(fault) = self.invoke(id, readiness) {
                report.faulted += 1;
                error!("{}", fault);
                let action = self
                    .handles
                    .get(id)
                    .map(|handle| handle.fault_action())
                    .unwrap_or(FaultAction::Deregister);
                match action {
                    FaultAction::Deregister => {
                        self.remove(id, &fault.reason);
                    }
                    FaultAction::Keep => {
                        warn!(handle = %fault.handle, "Keeping faulted handle registered");
                    }
                }
            }
        }
        report.drained = self.bus.drain_pending();
        report
    }

    fn invoke(&mut self, id: HandleId, readiness: Readiness) -> Option<HandleFault> {
        let bus = &self.bus;
        let handle = self.handles.get_mut(id)?;
        let outcome = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
            if readiness.readable {
                handle.handle_read(bus)?;
            }
            if readiness.writable {
                handle.handle_write(bus)?;
            }
            Ok(())
        }));
        let reason = match outcome {
            Ok(Ok(())) => return None,
            Ok(Err(err)) => format!("{:#}", err),
            Err(panic) => panic_message(panic.as_ref()),
        };
        Some(HandleFault {
            handle: handle.name().to_string(),
            reason,
        })
    }

    /// Runs the loop on the calling thread until shutdown is requested.
    ///
    /// On the way out the queue is drained one final time, every handle is
    /// closed, and the state becomes [`DispatcherState::Stopped`].
    pub fn run(&mut self) -> Result<(), DispatchError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                DispatcherState::Idle => *state = DispatcherState::Running,
                DispatcherState::Stopping => {}
                DispatcherState::Running | DispatcherState::Stopped => {
                    return Err(DispatchError::Stopped)
                }
            }
        }
        self.bus.set_dispatch_thread(Some(thread::current().id()));
        info!(
            handles = self.handles.len(),
            "Dispatcher running. Poll timeout {:?}.", self.config.poll_timeout
        );
        SystemEvent::EngineStarted.announce(&self.bus);

        let mut iterations: u64 = 0;
        while self.state() == DispatcherState::Running {
            self.run_once();
            iterations += 1;
        }

        SystemEvent::EngineStopping.announce(&self.bus);
        self.bus.drain_pending();
        let ids: Vec<HandleId> = self.handles.keys().collect();
        for id in ids {
            self.remove(id, "shutdown");
        }
        self.bus.drain_pending();

        *self.shared.state.lock() = DispatcherState::Stopped;
        SystemEvent::EngineStopped.announce(&self.bus);
        self.bus.set_dispatch_thread(None);
        info!(iterations, "Dispatcher has stopped.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Message;
    use crate::common::Payload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Ready for `remaining` iterations, publishing a tick each time.
    struct Ticker {
        remaining: usize,
        closed: Arc<AtomicUsize>,
    }

    impl IoHandle for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        fn poll_ready(&mut self) -> Readiness {
            if self.remaining > 0 {
                Readiness::READABLE
            } else {
                Readiness::NONE
            }
        }

        fn handle_read(&mut self, bus: &MessageBus) -> anyhow::Result<()> {
            self.remaining -= 1;
            bus.publish("tick", Payload::new().with("left", self.remaining as i64))?;
            Ok(())
        }

        fn handle_close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Faulty {
        panics: bool,
        action: FaultAction,
        calls: Arc<AtomicUsize>,
    }

    impl IoHandle for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn poll_ready(&mut self) -> Readiness {
            Readiness::READABLE
        }

        fn handle_read(&mut self, _bus: &MessageBus) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("socket exploded");
            }
            anyhow::bail!("read failed")
        }

        fn fault_action(&self) -> FaultAction {
            self.action
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            MessageBus::new(),
            DispatcherConfig {
                poll_timeout: Duration::from_millis(5),
            },
        )
    }

    fn count_topic(bus: &MessageBus, pattern: &str) -> Arc<AtomicUsize> {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        bus.subscribe(pattern, move |_: &Message| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        seen
    }

    #[test]
    fn ready_handles_run_and_idle_ones_do_not() {
        let mut dispatcher = dispatcher();
        let ticks = count_topic(dispatcher.bus(), "tick");
        let closed = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(Box::new(Ticker {
                remaining: 2,
                closed: closed.clone(),
            }))
            .unwrap();

        assert_eq!(dispatcher.run_once().ready, 1);
        assert_eq!(dispatcher.run_once().ready, 1);
        assert_eq!(dispatcher.run_once().ready, 0);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn faulting_handle_is_deregistered_and_loop_continues() {
        let mut dispatcher = dispatcher();
        let removed = count_topic(dispatcher.bus(), "gateway.system.handle_removed");
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(Box::new(Faulty {
                panics: true,
                action: FaultAction::Deregister,
                calls: calls.clone(),
            }))
            .unwrap();
        dispatcher
            .register(Box::new(Ticker {
                remaining: 3,
                closed: Arc::new(AtomicUsize::new(0)),
            }))
            .unwrap();

        let first = dispatcher.run_once();
        assert_eq!(first.faulted, 1);
        assert_eq!(dispatcher.handle_names(), vec!["ticker".to_string()]);

        let second = dispatcher.run_once();
        assert_eq!(second.faulted, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_may_ask_to_be_kept_after_a_fault() {
        let mut dispatcher = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(Box::new(Faulty {
                panics: false,
                action: FaultAction::Keep,
                calls: calls.clone(),
            }))
            .unwrap();

        dispatcher.run_once();
        dispatcher.run_once();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.handle_count(), 1);
    }

    #[test]
    fn cross_thread_messages_are_drained_on_the_loop_thread() {
        let mut dispatcher = dispatcher();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher
            .bus()
            .subscribe("report", move |_: &Message| {
                sink.lock().unwrap().push(thread::current().id());
                Ok(())
            })
            .unwrap();

        let publisher = dispatcher.bus().publisher();
        thread::spawn(move || publisher.publish("report", Payload::new()).unwrap())
            .join()
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());

        let report = dispatcher.run_once();
        assert_eq!(report.drained, 1);
        assert_eq!(*seen.lock().unwrap(), vec![thread::current().id()]);
    }

    #[test]
    fn shutdown_from_another_thread_stops_the_loop() {
        let mut dispatcher = Dispatcher::new(
            MessageBus::new(),
            DispatcherConfig {
                poll_timeout: Duration::from_secs(30),
            },
        );
        let stopped = count_topic(dispatcher.bus(), "gateway.system.stopped");
        let closed = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(Box::new(Ticker {
                remaining: 0,
                closed: closed.clone(),
            }))
            .unwrap();
        let control = dispatcher.control();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            control.shutdown();
        });
        dispatcher.run().unwrap();
        stopper.join().unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handle_count(), 0);
    }

    #[test]
    fn registration_is_refused_once_stopping() {
        let mut dispatcher = dispatcher();
        dispatcher.control().shutdown();
        let err = dispatcher
            .register(Box::new(Ticker {
                remaining: 1,
                closed: Arc::new(AtomicUsize::new(0)),
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::NotAccepting(DispatcherState::Stopping)
        ));

        dispatcher.run().unwrap();
        assert!(matches!(dispatcher.run(), Err(DispatchError::Stopped)));
    }
}
