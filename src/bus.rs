//! Per-run event bus.
//!
//! A single producer (the run controller) publishes events; any number of
//! subscribers each receive their own unbounded queue of every event
//! published after they subscribed. Closing the bus drops every sender, so
//! each subscription ends once its queue is drained.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use conductor_common::{EventBody, RunEvent, RunId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::errors::ControllerFault;

struct BusInner {
    next_seq: u64,
    subscribers: Vec<UnboundedSender<RunEvent>>,
    closed: bool,
}

#[derive(Clone)]
pub struct EventBus {
    run_id: RunId,
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            inner: Arc::new(Mutex::new(BusInner {
                next_seq: 0,
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        // The guarded state stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp `body` with the next sequence number and fan it out.
    ///
    /// Subscribers whose receiving side is gone are pruned here; a slow
    /// subscriber only grows its own queue and never blocks the producer.
    pub fn publish(&self, body: EventBody) -> Result<RunEvent, ControllerFault> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ControllerFault::BusClosed {
                run_id: self.run_id.to_string(),
            });
        }
        let event = RunEvent {
            seq: inner.next_seq,
            ts: Utc::now(),
            body,
        };
        inner.next_seq += 1;
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        Ok(event)
    }

    /// Join the live tail of the event sequence.
    ///
    /// Events published before this call are not replayed. Subscribing to a
    /// closed bus yields a subscription that ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        Subscription {
            run_id: self.run_id,
            rx,
        }
    }

    /// Signal the end of the sequence to every subscriber. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.lock().next_seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// One subscriber's view of a run's events.
pub struct Subscription {
    run_id: RunId,
    rx: UnboundedReceiver<RunEvent>,
}

impl Subscription {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next event, or `None` once the bus is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<RunEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::EventKind;

    fn enter(node: &str) -> EventBody {
        EventBody::Enter {
            node: node.to_string(),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_gapless_from_zero() {
        let bus = EventBus::new(RunId::new());
        let mut sub = bus.subscribe();
        for node in ["a", "b", "c"] {
            bus.publish(enter(node)).unwrap();
        }
        bus.close();

        let mut seqs = Vec::new();
        while let Some(event) = sub.recv().await {
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let bus = EventBus::new(RunId::new());
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(enter("a")).unwrap();
        bus.publish(enter("b")).unwrap();
        bus.close();

        for sub in [&mut first, &mut second] {
            let a = sub.recv().await.unwrap();
            let b = sub.recv().await.unwrap();
            assert_eq!(a.node(), Some("a"));
            assert_eq!(b.node(), Some("b"));
            assert!(sub.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_live_tail_only() {
        let bus = EventBus::new(RunId::new());
        bus.publish(enter("early")).unwrap();
        let mut late = bus.subscribe();
        bus.publish(enter("late")).unwrap();
        bus.close();

        let event = late.recv().await.unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.node(), Some("late"));
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_producer() {
        let bus = EventBus::new(RunId::new());
        let dropped = bus.subscribe();
        let mut kept = bus.subscribe();
        drop(dropped);

        bus.publish(enter("a")).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.recv().await.unwrap().kind(), EventKind::Enter);
    }

    #[tokio::test]
    async fn subscribing_after_close_ends_immediately() {
        let bus = EventBus::new(RunId::new());
        bus.close();
        let mut sub = bus.subscribe();
        assert!(sub.recv().await.is_none());
        assert!(bus.is_closed());
    }

    #[test]
    fn publish_after_close_is_a_fault() {
        let bus = EventBus::new(RunId::new());
        bus.close();
        let err = bus.publish(enter("x")).unwrap_err();
        assert!(matches!(err, ControllerFault::BusClosed { .. }));
        assert_eq!(bus.published(), 0);
    }
}
