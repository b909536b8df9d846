use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use parlor_types::events::ServerEvent;

/// A serialized event, ready to be written as a text frame. Cheap to clone.
pub type Payload = Utf8Bytes;

/// Registry of live connections and the single fan-out point for events.
///
/// Every registered connection receives every broadcast; room filtering is
/// left to clients.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    /// conn_id -> outbound queue. The hub holds the only strong sender, so
    /// removing an entry closes that connection's queue.
    connections: RwLock<HashMap<Uuid, mpsc::Sender<Payload>>>,
}

/// What a connection gets back from [`Hub::register`].
pub struct Registration {
    pub conn_id: Uuid,
    /// Receiving end of the outbound queue, drained by the write loop.
    pub outbound: mpsc::Receiver<Payload>,
    /// Handle for messages addressed to this connection alone. Weak so that
    /// unregistering still closes the queue.
    pub direct: mpsc::WeakSender<Payload>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection with an outbound queue of `capacity` frames.
    pub fn register(&self, capacity: usize) -> Registration {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity);
        let direct = tx.downgrade();

        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_id, tx);

        debug!("Registered connection {}", conn_id);
        Registration {
            conn_id,
            outbound: rx,
            direct,
        }
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn unregister(&self, conn_id: Uuid) -> bool {
        let removed = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id)
            .is_some();

        if removed {
            debug!("Unregistered connection {}", conn_id);
        }
        removed
    }

    /// Enqueue `payload` for every registered connection without waiting.
    /// Connections whose queue is full (or already closed) miss this payload.
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, payload: Payload) -> usize {
        let connections = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        for (conn_id, tx) in connections.iter() {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Outbound queue full for connection {}, dropping payload", conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    trace!("Connection {} already closed, skipping", conn_id);
                }
            }
        }
        delivered
    }

    /// Serialize and broadcast an event.
    pub fn broadcast_event(&self, event: &ServerEvent) -> usize {
        match event.to_json() {
            Ok(json) => self.broadcast(Payload::from(json)),
            Err(e) => {
                error!("Failed to serialize gateway event: {}", e);
                0
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every registration. Each write loop then sees its queue close,
    /// sends a close frame and the connection tears down.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_every_connection_once() {
        let hub = Hub::new();
        let mut regs: Vec<_> = (0..3).map(|_| hub.register(4)).collect();

        assert_eq!(hub.broadcast(Payload::from("hello")), 3);

        for reg in &mut regs {
            assert_eq!(reg.outbound.try_recv().unwrap().as_str(), "hello");
            assert!(reg.outbound.try_recv().is_err());
        }
    }

    #[test]
    fn test_full_queue_is_skipped_without_blocking() {
        let hub = Hub::new();
        let mut slow = hub.register(1);
        let mut fast = hub.register(8);

        assert_eq!(hub.broadcast(Payload::from("one")), 2);
        // slow's single slot is still occupied
        assert_eq!(hub.broadcast(Payload::from("two")), 1);

        assert_eq!(slow.outbound.try_recv().unwrap().as_str(), "one");
        assert!(slow.outbound.try_recv().is_err());

        assert_eq!(fast.outbound.try_recv().unwrap().as_str(), "one");
        assert_eq!(fast.outbound.try_recv().unwrap().as_str(), "two");
    }

    #[test]
    fn test_unregister_is_idempotent_and_closes_queue() {
        let hub = Hub::new();
        let mut reg = hub.register(4);
        assert_eq!(hub.connection_count(), 1);

        assert!(hub.unregister(reg.conn_id));
        assert!(!hub.unregister(reg.conn_id));
        assert_eq!(hub.connection_count(), 0);

        assert!(reg.direct.upgrade().is_none());
        assert!(matches!(
            reg.outbound.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(hub.broadcast(Payload::from("late")), 0);
    }

    #[test]
    fn test_dropped_receiver_is_tolerated() {
        let hub = Hub::new();
        let gone = hub.register(4);
        let mut alive = hub.register(4);
        drop(gone.outbound);

        assert_eq!(hub.broadcast(Payload::from("x")), 1);
        assert_eq!(alive.outbound.try_recv().unwrap().as_str(), "x");
    }

    #[test]
    fn test_close_all_releases_queues() {
        let hub = Hub::new();
        let mut a = hub.register(4);
        let mut b = hub.register(4);

        assert_eq!(hub.close_all(), 2);
        assert_eq!(hub.connection_count(), 0);
        for reg in [&mut a, &mut b] {
            assert!(matches!(
                reg.outbound.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            ));
        }
    }

    #[test]
    fn test_broadcast_event_serializes_envelope() {
        let hub = Hub::new();
        let mut reg = hub.register(4);
        hub.broadcast_event(&ServerEvent::Announcement {
            announcement: "hi".into(),
        });

        let payload = reg.outbound.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(payload.as_str()).unwrap();
        assert_eq!(value["type"], "announcement");
        assert_eq!(value["data"]["announcement"], "hi");
    }

    #[test]
    fn test_concurrent_register_and_broadcast() {
        let hub = Hub::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    let reg = hub.register(64);
                    hub.broadcast(Payload::from("ping"));
                    reg
                })
            })
            .collect();

        let regs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(hub.connection_count(), 8);
        for reg in regs {
            assert!(hub.unregister(reg.conn_id));
        }
        assert_eq!(hub.connection_count(), 0);
    }
}
