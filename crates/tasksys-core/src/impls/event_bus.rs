//! EventBus - プロセス内 pub/sub
//!
//! # 設計
//! - グローバル購読者（全イベント）とイベント種別ごとの購読者を持つ
//! - シングルトンではなく、明示的に生成して各コンポーネントへ渡す（clone は同じバスを共有）
//! - `publish` はロック内で購読者リストを複製し、コールバックはロックの外で呼ぶ
//!   （コールバック内から subscribe / publish しても deadlock しない）
//! - コールバックは publish したスレッド上で同期的に実行される

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tracing::error;

use crate::domain::{EventKind, TaskEvent};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    global: Vec<(SubscriptionId, Callback)>,
    by_kind: HashMap<EventKind, Vec<(SubscriptionId, Callback)>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind, or to every event when `kind` is `None`.
    pub fn subscribe<F>(&self, kind: Option<EventKind>, callback: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        let entry = (id, Arc::new(callback) as Callback);
        match kind {
            Some(kind) => inner.by_kind.entry(kind).or_default().push(entry),
            None => inner.global.push(entry),
        }
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.subscriber_count();
        inner.global.retain(|(sid, _)| *sid != id);
        for subscribers in inner.by_kind.values_mut() {
            subscribers.retain(|(sid, _)| *sid != id);
        }
        inner.by_kind.retain(|_, subscribers| !subscribers.is_empty());
        inner.subscriber_count() != before
    }

    pub fn publish(&self, event: TaskEvent) {
        let callbacks: Vec<Callback> = {
            let inner = lock(&self.inner);
            inner
                .global
                .iter()
                .chain(inner.by_kind.get(&event.kind()).into_iter().flatten())
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(event = %event.kind(), "event subscriber panicked");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscriber_count()
    }
}

impl BusInner {
    fn subscriber_count(&self) -> usize {
        self.global.len() + self.by_kind.values().map(Vec::len).sum::<usize>()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn kind_subscribers_only_see_their_kind() {
        let bus = EventBus::new();
        let added = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&added);
        bus.subscribe(Some(EventKind::TaskAdded), move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let g = Arc::clone(&all);
        bus.subscribe(None, move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });

        let task_id = TaskId::generate();
        bus.publish(TaskEvent::TaskAdded { task_id });
        bus.publish(TaskEvent::TaskRemoved { task_id });
        bus.publish(TaskEvent::SystemReady);

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(Some(EventKind::SystemReady), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(TaskEvent::SystemReady);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(TaskEvent::SystemReady);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn callbacks_may_publish_and_panics_are_contained() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Some(EventKind::SystemReady), |_| panic!("boom"));

        let inner_bus = bus.clone();
        bus.subscribe(Some(EventKind::SystemReady), move |_| {
            inner_bus.publish(TaskEvent::TaskAdded {
                task_id: TaskId::generate(),
            });
        });
        let s = Arc::clone(&seen);
        bus.subscribe(Some(EventKind::TaskAdded), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(TaskEvent::SystemReady);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
