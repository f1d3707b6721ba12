//! The Message Bus: topic-addressed publish/subscribe with a cross-thread queue.
//!
//! Subscribers register a topic pattern and a callback. A publish delivers the
//! message synchronously, on the publishing thread, to every subscription whose
//! pattern equals the topic or is one of its ancestors, in registration order.
//!
//! Worker threads must not run subscriber callbacks themselves, because those
//! callbacks may touch state owned by the dispatcher thread. They use
//! [`MessageBus::publish_threadsafe`] (or a [`CrossThreadPublisher`]) instead,
//! which only enqueues. The dispatcher delivers queued messages when it calls
//! [`MessageBus::drain_pending`].
//!
//! The subscription table and the queue share a single lock. Callbacks always
//! run with that lock released, so they are free to publish, subscribe or
//! unsubscribe.

use crate::common::{Payload, SubscriptionId, Topic};
use crate::error::{BusError, SubscriberError};
use crate::reactor::Waker;
use crate::reply::Responder;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{error, trace};

/// The signature of a subscriber callback.
pub type Callback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// A published message: a topic, its frozen payload, and for remote commands
/// the channel on which listeners answer.
#[derive(Debug, Clone)]
pub struct Message {
    topic: Topic,
    payload: Payload,
    responder: Option<Responder>,
}

impl Message {
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self {
            topic,
            payload,
            responder: None,
        }
    }

    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn responder(&self) -> Option<&Responder> {
        self.responder.as_ref()
    }
}

struct Subscription {
    pattern: Topic,
    seq: u64,
    callback: Callback,
}

#[derive(Default)]
struct BusState {
    subscriptions: SlotMap<SubscriptionId, Subscription>,
    next_seq: u64,
    pending: VecDeque<Message>,
    waker: Option<Waker>,
    dispatch_thread: Option<ThreadId>,
}

/// A cheaply cloneable handle to one bus instance.
///
/// The bus is constructed explicitly and handed to every component; there is
/// no process-wide instance.
#[derive(Clone, Default)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every topic equal to or below `pattern`.
    pub fn subscribe<T, F>(&self, pattern: T, callback: F) -> Result<SubscriptionId, BusError>
    where
        T: TryInto<Topic>,
        BusError: From<T::Error>,
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let pattern = pattern.try_into()?;
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        trace!(pattern = %pattern, seq, "Subscribed");
        Ok(state.subscriptions.insert(Subscription {
            pattern,
            seq,
            callback: Arc::new(callback),
        }))
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().subscriptions.remove(id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Publishes synchronously on the calling thread.
    ///
    /// Returns the number of subscribers the message was delivered to.
    pub fn publish<T>(&self, topic: T, payload: Payload) -> Result<usize, BusError>
    where
        T: TryInto<Topic>,
        BusError: From<T::Error>,
    {
        Ok(self.dispatch(&Message::new(topic.try_into()?, payload)))
    }

    /// Publishes a prepared message synchronously on the calling thread.
    pub fn publish_message(&self, message: Message) -> usize {
        self.dispatch(&message)
    }

    /// Enqueues a message for delivery on the dispatcher thread.
    ///
    /// Safe to call from any thread. Subscribers never run on the caller's
    /// thread; delivery happens during the dispatcher's next drain.
    pub fn publish_threadsafe<T>(&self, topic: T, payload: Payload) -> Result<(), BusError>
    where
        T: TryInto<Topic>,
        BusError: From<T::Error>,
    {
        self.enqueue(Message::new(topic.try_into()?, payload));
        Ok(())
    }

    /// Enqueues a prepared message for delivery on the dispatcher thread.
    pub fn enqueue(&self, message: Message) {
        let waker = {
            let mut state = self.state.lock();
            state.pending.push_back(message);
            state.waker.clone()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// A handle for worker threads that can only enqueue.
    pub fn publisher(&self) -> CrossThreadPublisher {
        CrossThreadPublisher { bus: self.clone() }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Delivers queued messages, in FIFO order, until the queue is empty.
    ///
    /// Must only be called from the dispatcher thread. Returns the number of
    /// messages drained.
    pub fn drain_pending(&self) -> usize {
        let mut drained = 0;
        loop {
            let next = self.state.lock().pending.pop_front();
            match next {
                Some(message) => {
                    self.dispatch(&message);
                    drained += 1;
                }
                None => return drained,
            }
        }
    }

    /// True when called on the thread currently running the dispatcher.
    pub fn on_dispatch_thread(&self) -> bool {
        self.state.lock().dispatch_thread == Some(thread::current().id())
    }

    pub(crate) fn bind_dispatcher(&self, waker: Waker) {
        self.state.lock().waker = Some(waker);
    }

    pub(crate) fn set_dispatch_thread(&self, id: Option<ThreadId>) {
        self.state.lock().dispatch_thread = id;
    }

    fn dispatch(&self, message: &Message) -> usize {
        let mut targets: Vec<(u64, Topic, Callback)> = {
            let state = self.state.lock();
            state
                .subscriptions
                .values()
                .filter(|sub| sub.pattern.is_prefix_of(&message.topic))
                .map(|sub| (sub.seq, sub.pattern.clone(), sub.callback.clone()))
                .collect()
        };
        targets.sort_unstable_by_key(|(seq, _, _)| *seq);

        for (_, pattern, callback) in &targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(message)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{:#}", err),
                Err(panic) => panic_message(panic.as_ref()),
            };
            let fault = SubscriberError {
                pattern: pattern.to_string(),
                topic: message.topic.to_string(),
                reason,
            };
            error!("{}", fault);
        }
        targets.len()
    }
}

/// A publisher for threads other than the dispatcher's.
#[derive(Clone)]
pub struct CrossThreadPublisher {
    bus: MessageBus,
}

impl CrossThreadPublisher {
    pub fn publish<T>(&self, topic: T, payload: Payload) -> Result<(), BusError>
    where
        T: TryInto<Topic>,
        BusError: From<T::Error>,
    {
        self.bus.publish_threadsafe(topic, payload)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use std::sync::Mutex as StdMutex;

    fn recorder(
        bus: &MessageBus,
        pattern: &str,
        label: &'static str,
        log: &Arc<StdMutex<Vec<String>>>,
    ) -> SubscriptionId {
        let log = log.clone();
        bus.subscribe(pattern, move |msg: &Message| {
            log.lock().unwrap().push(format!("{}:{}", label, msg.topic()));
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn delivers_in_registration_order_exactly_once() {
        let bus = MessageBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&bus, "a.b", "first", &log);
        recorder(&bus, "a", "second", &log);
        recorder(&bus, "a.b.c", "third", &log);

        let delivered = bus.publish("a.b.c", Payload::new()).unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:a.b.c", "second:a.b.c", "third:a.b.c"]
        );
    }

    #[test]
    fn prefix_subscription_skips_siblings() {
        let bus = MessageBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&bus, "a.b", "sub", &log);

        bus.publish("a.b", Payload::new()).unwrap();
        bus.publish("a.b.c", Payload::new()).unwrap();
        bus.publish("a.c", Payload::new()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["sub:a.b", "sub:a.b.c"]);
    }

    #[test]
    fn order_survives_unsubscribe_and_key_reuse() {
        let bus = MessageBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let first = recorder(&bus, "t", "first", &log);
        recorder(&bus, "t", "second", &log);
        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        recorder(&bus, "t", "third", &log);

        bus.publish("t", Payload::new()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["second:t", "third:t"]);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let bus = MessageBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe("t", |_: &Message| -> anyhow::Result<()> { anyhow::bail!("boom") })
            .unwrap();
        bus.subscribe("t", |_: &Message| -> anyhow::Result<()> { panic!("kaboom") })
            .unwrap();
        recorder(&bus, "t", "survivor", &log);

        assert_eq!(bus.publish("t", Payload::new()).unwrap(), 3);
        assert_eq!(*log.lock().unwrap(), vec!["survivor:t"]);
    }

    #[test]
    fn threadsafe_publish_waits_for_drain_on_the_draining_thread() {
        let bus = MessageBus::new();
        let seen_on = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen_on.clone();
        bus.subscribe("w", move |msg: &Message| {
            sink.lock()
                .unwrap()
                .push((thread::current().id(), msg.payload().get("n").cloned()));
            Ok(())
        })
        .unwrap();

        let publisher = bus.publisher();
        std::thread::spawn(move || {
            for n in 0..3 {
                publisher.publish("w", Payload::new().with("n", n)).unwrap();
            }
        })
        .join()
        .unwrap();

        assert!(seen_on.lock().unwrap().is_empty());
        assert_eq!(bus.pending_len(), 3);
        assert_eq!(bus.drain_pending(), 3);

        let seen = seen_on.lock().unwrap();
        let here = thread::current().id();
        assert!(seen.iter().all(|(id, _)| *id == here));
        let values: Vec<_> = seen.iter().map(|(_, v)| v.clone()).collect();
        assert_eq!(
            values,
            vec![Some(Value::Int(0)), Some(Value::Int(1)), Some(Value::Int(2))]
        );
    }

    #[test]
    fn callbacks_may_publish_and_subscribe_reentrantly() {
        let bus = MessageBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let inner = bus.clone();
        bus.subscribe("outer", move |_: &Message| {
            inner.publish("inner.event", Payload::new())?;
            inner.subscribe("late", |_: &Message| Ok(()))?;
            Ok(())
        })
        .unwrap();
        recorder(&bus, "inner", "inner", &log);

        bus.publish("outer", Payload::new()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["inner:inner.event"]);
        assert_eq!(bus.subscription_count(), 3);
    }

    #[test]
    fn invalid_topics_are_rejected() {
        let bus = MessageBus::new();
        assert!(bus.publish("a..b", Payload::new()).is_err());
        assert!(bus.subscribe("", |_: &Message| Ok(())).is_err());
    }
}
