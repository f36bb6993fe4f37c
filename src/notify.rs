use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle changes surfaced to external listeners (the calendar sync
/// coordinator among them). Internal transitions with no calendar effect
/// (confirmation, completion) stay internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Created,
    Rescheduled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub kind: NoticeKind,
    pub booking_id: Ulid,
    /// The service whose channel carried this notice.
    pub service_id: Ulid,
    pub scheduled_at: Ms,
}

/// Broadcast hub: one channel per service. Subscribing is cheap; sending to
/// a service nobody watches is a no-op.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to booking notices for a service. Creates the channel if
    /// needed.
    pub fn subscribe(&self, service_id: Ulid) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .channels
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn send(&self, notice: BookingNotice) {
        if let Some(sender) = self.channels.get(&notice.service_id) {
            let _ = sender.send(notice);
        }
    }

    /// Drop a service's channel.
    pub fn remove(&self, service_id: &Ulid) {
        self.channels.remove(service_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(sid);

        let notice = BookingNotice {
            kind: NoticeKind::Created,
            booking_id: Ulid::new(),
            service_id: sid,
            scheduled_at: 1_700_000_040_000,
        };
        hub.send(notice.clone());

        assert_eq!(rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(BookingNotice {
            kind: NoticeKind::Cancelled,
            booking_id: Ulid::new(),
            service_id: Ulid::new(),
            scheduled_at: 0,
        });
    }

    #[tokio::test]
    async fn channels_are_per_service() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(BookingNotice {
            kind: NoticeKind::Rescheduled,
            booking_id: Ulid::new(),
            service_id: a,
            scheduled_at: 1_700_000_040_000,
        });

        assert_eq!(rx_a.recv().await.unwrap().service_id, a);
        // b's channel saw nothing
        assert!(matches!(
            hub.subscribe(b).try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
