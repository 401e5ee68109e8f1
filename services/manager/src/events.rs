//! In-process notification channel for volume events.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use holdfast_events::{AggregateType, EventEnvelope, VolumeEvent};
use holdfast_id::{AggregateSeq, EventId};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Buffered events per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1024;

pub type VolumeEnvelope = Arc<EventEnvelope<VolumeEvent>>;

/// Broadcasts enveloped volume events to every subscriber.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VolumeEnvelope>,
    next_id: Arc<AtomicI64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEnvelope> {
        self.tx.subscribe()
    }

    /// Wraps the event in an envelope and broadcasts it.
    pub fn publish(&self, volume: &str, seq: AggregateSeq, event: VolumeEvent) {
        let event_type = event.event_type();
        let envelope = EventEnvelope::builder()
            .event_id(EventId::new(self.next_id.fetch_add(1, Ordering::SeqCst)))
            .aggregate(AggregateType::Volume, volume)
            .aggregate_seq(seq)
            .event_type(event_type)
            .payload(event)
            .build();

        match envelope {
            Ok(envelope) => {
                debug!(volume = %volume, event_type, seq = seq.value(), "Event published");
                // No subscribers is fine; events are best-effort notifications.
                let _ = self.tx.send(Arc::new(envelope));
            }
            Err(e) => warn!(volume = %volume, event_type, error = %e, "Failed to build event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_events::{event_types, VolumeDeletedPayload};
    use holdfast_id::VolumeName;

    #[tokio::test]
    async fn test_subscribers_receive_ordered_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let volume = VolumeName::parse("vol-a").unwrap();

        for seq in [AggregateSeq::FIRST, AggregateSeq::FIRST.next()] {
            bus.publish(
                volume.as_str(),
                seq,
                VolumeEvent::Deleted(VolumeDeletedPayload {
                    volume: volume.clone(),
                }),
            );
        }

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event_type, event_types::VOLUME_DELETED);
        assert_eq!(first.aggregate_id, "vol-a");
        assert!(first.event_id.value() < second.event_id.value());
        assert_eq!(second.aggregate_seq, AggregateSeq::FIRST.next());
    }
}
