use std::sync::{Arc, Mutex, MutexGuard};
use futures::StreamExt;
use futures::channel::mpsc::{channel, Receiver, Sender};
use log::{debug, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::types::EventRecord;

type Subscribers = Arc<Mutex<Vec<Sender<EventRecord>>>>;

/// Handed to the state machine. Publishing never waits: when the queue is full the event is dropped.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    queue: Sender<EventRecord>,
}

impl EventPublisher {
    pub fn new(queue: Sender<EventRecord>) -> Self {
        EventPublisher { queue }
    }

    pub fn publish(&mut self, record: EventRecord) {
        if let Err(err) = self.queue.try_send(record) {
            if err.is_full() {
                warn!("Event queue is full, dropping {:?}", err.into_inner());
            } else {
                debug!("Event dispatcher stopped, dropping {:?}", err.into_inner());
            }
        }
    }
}

/// Fans published events out to one bounded channel per subscriber.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    subscribers: Subscribers,
    capacity: usize,
}

impl EventDispatcher {
    /// Only events published after this call are delivered.
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = channel(self.capacity);
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

fn lock(subscribers: &Subscribers) -> MutexGuard<'_, Vec<Sender<EventRecord>>> {
    // a panicking subscriber push can not leave the list in a broken state
    subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fan_out(subscribers: &Subscribers, record: EventRecord) {
    lock(subscribers).retain_mut(|subscriber| match subscriber.try_send(record.clone()) {
        Ok(()) => true,
        Err(err) if err.is_disconnected() => {
            debug!("Subscriber went away");
            false
        },
        Err(_) => {
            warn!("Subscriber is not keeping up, dropping event");
            true
        },
    })
}

pub fn event_dispatcher_task(cancel: CancellationToken, capacity: usize) -> (EventDispatcher, EventPublisher, JoinHandle<()>) {
    let (tx, mut rx) = channel::<EventRecord>(capacity);
    let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = EventDispatcher { subscribers: subscribers.clone(), capacity };

    let handle = spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                record = rx.next() => match record {
                    Some(record) => fan_out(&subscribers, record),
                    None => break 'mainloop,
                },
            }
        }
    });

    (dispatcher, EventPublisher::new(tx), handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::{ConnectionState, EventKind};

    fn record(message: &str) -> EventRecord {
        EventRecord {
            kind: EventKind::Loading,
            battery_voltage: 0.0,
            connection_state: ConnectionState::Initializing,
            message: String::from(message),
            operation: None,
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let cancel = CancellationToken::new();
        let (dispatcher, mut publisher, handle) = event_dispatcher_task(cancel.clone(), 8);
        let mut first = dispatcher.subscribe();
        let mut second = dispatcher.subscribe();

        publisher.publish(record("one"));
        publisher.publish(record("two"));

        for subscriber in [&mut first, &mut second] {
            assert_eq!(subscriber.next().await.unwrap().message, "one");
            assert_eq!(subscriber.next().await.unwrap().message, "two");
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let cancel = CancellationToken::new();
        let (dispatcher, mut publisher, handle) = event_dispatcher_task(cancel.clone(), 8);
        let mut early = dispatcher.subscribe();

        publisher.publish(record("before"));
        assert_eq!(early.next().await.unwrap().message, "before");

        let mut late = dispatcher.subscribe();
        publisher.publish(record("after"));

        assert_eq!(late.next().await.unwrap().message, "after");
        assert_eq!(early.next().await.unwrap().message, "after");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_subscribers_are_forgotten() {
        let cancel = CancellationToken::new();
        let (dispatcher, mut publisher, handle) = event_dispatcher_task(cancel.clone(), 8);
        let mut kept = dispatcher.subscribe();
        drop(dispatcher.subscribe());
        assert_eq!(dispatcher.subscriber_count(), 2);

        publisher.publish(record("ping"));
        assert_eq!(kept.next().await.unwrap().message, "ping");
        assert_eq!(dispatcher.subscriber_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn task_stops_when_publishers_are_gone() {
        let (_dispatcher, publisher, handle) = event_dispatcher_task(CancellationToken::new(), 8);
        drop(publisher);
        handle.await.unwrap();
    }
}
