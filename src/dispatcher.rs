//! Event dispatcher worker.
//!
//! The connector hands events to an `EventSink`; a single worker thread drains
//! the bounded queue and invokes every service registered on the event's
//! channel, in registration order. Handler failures (errors or panics) are
//! logged and counted and never reach the transport. Once an event has been
//! offered to all its services the channel's replay cursor moves past it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, warn};

use crate::bayeux::StreamEvent;
use crate::config::DispatcherConfig;
use crate::connector::EventConsumer;
use crate::error::DispatchError;
use crate::registry::{RegisteredService, SubscriptionRegistry};

/// Invoke one service's handler for one event, containing any failure.
pub fn dispatch(service: &RegisteredService, event: &StreamEvent) -> Result<(), DispatchError> {
    match catch_unwind(AssertUnwindSafe(|| service.handler.on_event(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DispatchError::HandlerFailed {
            channel: event.channel.clone(),
            message: e.to_string(),
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(DispatchError::HandlerPanicked {
                channel: event.channel.clone(),
                message,
            })
        }
    }
}

/// Counters since the dispatcher started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events taken off the queue.
    pub events: u64,
    /// Successful handler invocations.
    pub deliveries: u64,
    /// Handler invocations that returned an error or panicked.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            events: self.events.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

enum ControlMsg {
    Shutdown,
}

/// Producer side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<StreamEvent>,
}

impl EventSink {
    /// Enqueue an event. Blocks while the queue is full.
    pub fn submit(&self, event: StreamEvent) -> Result<(), DispatchError> {
        self.tx.send(event).map_err(|_| DispatchError::Closed)
    }

    /// Adapt into a connector consumer.
    #[must_use]
    pub fn into_consumer(self) -> EventConsumer {
        Arc::new(move |event: StreamEvent| {
            let channel = event.channel.clone();
            if let Err(e) = self.submit(event) {
                warn!(channel = %channel, error = %e, "event dropped");
            }
        })
    }
}

/// Single-consumer event dispatcher.
#[derive(Debug)]
pub struct EventDispatcher {
    events_tx: Sender<StreamEvent>,
    control_tx: Sender<ControlMsg>,
    counters: Arc<Counters>,
    worker: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Spawn the worker.
    pub fn start(cfg: DispatcherConfig, registry: Arc<Mutex<SubscriptionRegistry>>) -> Result<Self, DispatchError> {
        let (events_tx, events_rx) = bounded::<StreamEvent>(cfg.queue_capacity.max(1));
        let (control_tx, control_rx) = bounded::<ControlMsg>(1);
        let counters = Arc::new(Counters::default());

        let thread_counters = Arc::clone(&counters);
        let join = thread::Builder::new()
            .name("eventlink-dispatch".to_string())
            .spawn(move || worker_loop(&registry, &thread_counters, &events_rx, &control_rx))
            .map_err(|_| DispatchError::Closed)?;

        Ok(Self {
            events_tx,
            control_tx,
            counters,
            worker: join.thread().id(),
            join: Mutex::new(Some(join)),
        })
    }

    #[must_use]
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.events_tx.clone(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Dispatch what is already queued, then stop the worker. Idempotent.
    ///
    /// Called from a handler (the worker thread itself) it only signals the
    /// worker, which exits after the current event.
    pub fn shutdown(&self) {
        let handle = {
            let mut guard = self.join.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        let Some(handle) = handle else {
            return;
        };
        let _ = self.control_tx.try_send(ControlMsg::Shutdown);
        if thread::current().id() == self.worker {
            return;
        }
        if handle.join().is_err() {
            warn!("dispatcher worker panicked");
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    registry: &Mutex<SubscriptionRegistry>,
    counters: &Counters,
    events_rx: &Receiver<StreamEvent>,
    control_rx: &Receiver<ControlMsg>,
) {
    loop {
        select! {
            recv(events_rx) -> msg => {
                match msg {
                    Ok(event) => handle_event(registry, counters, &event),
                    Err(_) => break,
                }
            }
            recv(control_rx) -> _ => {
                while let Ok(event) = events_rx.try_recv() {
                    handle_event(registry, counters, &event);
                }
                break;
            }
        }
    }
    debug!("dispatcher worker exited");
}

fn handle_event(registry: &Mutex<SubscriptionRegistry>, counters: &Counters, event: &StreamEvent) {
    counters.events.fetch_add(1, Ordering::Relaxed);

    let services = registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .services_for(&event.channel);

    for service in &services {
        match dispatch(service, event) {
            Ok(()) => {
                counters.deliveries.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %service.id,
                    channel = %event.channel,
                    replay_id = ?event.replay_id,
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }

    if let Some(replay_id) = event.replay_id {
        registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance(&event.channel, replay_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{json, Map, Value};

    use crate::registry::{EventHandler, HandlerResult, ReplayFrom};

    fn event(channel: &str, replay_id: i64) -> StreamEvent {
        let Value::Object(payload) = json!({"event": {"replayId": replay_id}, "sobject": {"n": replay_id}}) else {
            unreachable!()
        };
        StreamEvent::new(channel, payload, Some(replay_id))
    }

    fn recorder(seen: Arc<Mutex<Vec<(String, i64)>>>, name: &'static str) -> Arc<dyn EventHandler> {
        Arc::new(move |e: &StreamEvent| -> HandlerResult {
            seen.lock().unwrap().push((name.to_string(), e.replay_id.unwrap()));
            Ok(())
        })
    }

    #[test]
    fn dispatch_contains_errors_and_panics() {
        let failing = RegisteredService {
            id: crate::registry::ServiceId::new(),
            channel: "/topic/A".to_string(),
            handler: Arc::new(|_: &StreamEvent| -> HandlerResult { Err("boom".into()) }),
        };
        let err = dispatch(&failing, &event("/topic/A", 1)).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerFailed { ref message, .. } if message == "boom"));

        let panicking = RegisteredService {
            handler: Arc::new(|_: &StreamEvent| -> HandlerResult { panic!("kaboom") }),
            ..failing
        };
        let err = dispatch(&panicking, &event("/topic/A", 2)).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerPanicked { ref message, .. } if message == "kaboom"));
    }

    #[test]
    fn worker_fans_out_in_registration_order_and_advances_cursor() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        {
            let mut r = registry.lock().unwrap();
            r.register("/topic/A", recorder(Arc::clone(&seen), "first"), ReplayFrom::LATEST);
            r.register("/topic/A", recorder(Arc::clone(&seen), "second"), ReplayFrom::LATEST);
        }

        let dispatcher = EventDispatcher::start(DispatcherConfig::default(), Arc::clone(&registry)).unwrap();
        let sink = dispatcher.sink();
        sink.submit(event("/topic/A", 1)).unwrap();
        sink.submit(event("/topic/A", 2)).unwrap();
        dispatcher.shutdown();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("first".to_string(), 1),
                ("second".to_string(), 1),
                ("first".to_string(), 2),
                ("second".to_string(), 2),
            ]
        );
        assert_eq!(registry.lock().unwrap().cursor("/topic/A"), Some(ReplayFrom::after(2)));
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                events: 2,
                deliveries: 4,
                failures: 0
            }
        );
    }

    #[test]
    fn failing_handler_does_not_block_later_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        {
            let mut r = registry.lock().unwrap();
            let seen_flaky = Arc::clone(&seen);
            r.register(
                "/topic/A",
                Arc::new(move |e: &StreamEvent| -> HandlerResult {
                    if e.replay_id == Some(2) {
                        return Err("rejects e2".into());
                    }
                    seen_flaky.lock().unwrap().push(("flaky".to_string(), e.replay_id.unwrap()));
                    Ok(())
                }),
                ReplayFrom::LATEST,
            );
            r.register("/topic/A", recorder(Arc::clone(&seen), "steady"), ReplayFrom::LATEST);
        }

        let dispatcher = EventDispatcher::start(DispatcherConfig::default(), Arc::clone(&registry)).unwrap();
        let consumer = dispatcher.sink().into_consumer();
        for id in 1..=3 {
            consumer(event("/topic/A", id));
        }
        dispatcher.shutdown();

        let seen = seen.lock().unwrap().clone();
        assert!(seen.contains(&("flaky".to_string(), 3)));
        assert!(seen.contains(&("steady".to_string(), 2)));
        assert!(seen.contains(&("steady".to_string(), 3)));
        assert_eq!(dispatcher.stats().failures, 1);
        assert_eq!(registry.lock().unwrap().cursor("/topic/A"), Some(ReplayFrom::after(3)));
    }

    #[test]
    fn submit_after_shutdown_is_closed() {
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let dispatcher = EventDispatcher::start(DispatcherConfig { queue_capacity: 1 }, registry).unwrap();
        let sink = dispatcher.sink();
        dispatcher.shutdown();
        dispatcher.shutdown();

        let mut payload = Map::new();
        payload.insert("k".to_string(), Value::Null);
        let err = sink.submit(StreamEvent::new("/topic/A", payload, None)).unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
    }
}
