//! Per-handle notification hub.  A single task owns the subscriber table;
//! everything else talks to it through commands, so publish never takes a
//! lock and a slow subscriber can only lose its own events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::engine::{Notification, NotificationType};

/// Bounded per-subscriber buffer; a full buffer drops the event for that
/// subscriber only.
const SUBSCRIBER_BUFFER: usize = 16;

enum HubCmd {
    Subscribe {
        filter: HashSet<NotificationType>,
        reply: oneshot::Sender<(u64, mpsc::Receiver<Notification>)>,
    },
    Unsubscribe(u64),
    Publish(Notification),
    Close,
}

struct Subscriber {
    filter: HashSet<NotificationType>,
    tx: mpsc::Sender<Notification>,
}

/// Cheap-clone handle onto one hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCmd>,
    dropped: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_hub(rx, Arc::clone(&dropped)));
        Self { tx, dropped }
    }

    /// Non-blocking; after close this is a no-op.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(HubCmd::Publish(notification));
    }

    /// Empty filter admits every notification type.
    pub async fn subscribe(&self, filter: HashSet<NotificationType>) -> Option<Subscription> {
        let (reply, answer) = oneshot::channel();
        self.tx.send(HubCmd::Subscribe { filter, reply }).ok()?;
        let (id, rx) = answer.await.ok()?;
        Some(Subscription {
            id,
            hub: self.clone(),
            rx,
        })
    }

    /// Drops every subscriber; their streams observe end-of-stream.
    pub fn close(&self) {
        let _ = self.tx.send(HubCmd::Close);
    }

    /// Events lost to full subscriber buffers since the hub started.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Live subscription; unsubscribes on drop, so a cancelled stream detaches
/// before its response future is collected.
pub struct Subscription {
    id: u64,
    hub: HubHandle,
    rx: mpsc::Receiver<Notification>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub.tx.send(HubCmd::Unsubscribe(self.id));
    }
}

async fn run_hub(mut rx: mpsc::UnboundedReceiver<HubCmd>, dropped: Arc<AtomicU64>) {
    let mut subscribers: HashMap<u64, Subscriber> = HashMap::new();
    let mut next_id: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCmd::Subscribe { filter, reply } => {
                let (tx, sub_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                let id = next_id;
                next_id += 1;
                if reply.send((id, sub_rx)).is_ok() {
                    subscribers.insert(id, Subscriber { filter, tx });
                }
            }
            HubCmd::Unsubscribe(id) => {
                subscribers.remove(&id);
            }
            HubCmd::Publish(notification) => {
                let mut gone = Vec::new();
                for (id, sub) in &subscribers {
                    if !sub.filter.is_empty() && !sub.filter.contains(&notification.kind) {
                        continue;
                    }
                    match sub.tx.try_send(notification.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(subscriber = id, "subscriber buffer full, event dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            gone.push(*id);
                        }
                    }
                }
                for id in gone {
                    subscribers.remove(&id);
                }
            }
            HubCmd::Close => break,
        }
    }
    // Dropping the table drops every subscriber sender.
}

/// Parses the `filter` query parameter: values may repeat and each value
/// may hold a comma-separated list.  Unknown names are ignored.
pub fn parse_filter<'a>(values: impl Iterator<Item = &'a str>) -> HashSet<NotificationType> {
    let mut filter = HashSet::new();
    for value in values {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(kind) = NotificationType::parse(part) {
                filter.insert(kind);
            }
        }
    }
    filter
}
