//! Download lifecycle events and the listener registry.
//!
//! Delivery is synchronous with the emitting task: a listener runs inline
//! before the part makes further progress, which preserves the per-part
//! ordering `downloading < downloaded < writing < done`. No ordering is
//! guaranteed across parts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The exported event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ObjectDownloading,
    PartDownloading,
    PartDownloaded,
    PartWriting,
    PartDone,
}

impl EventKind {
    /// Wire name, e.g. `part:downloaded`.
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::ObjectDownloading => "object:downloading",
            EventKind::PartDownloading => "part:downloading",
            EventKind::PartDownloaded => "part:downloaded",
            EventKind::PartWriting => "part:writing",
            EventKind::PartDone => "part:done",
        }
    }
}

/// A single lifecycle notification.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Emitted once, after the probe succeeds and delivery starts.
    ObjectDownloading { object_size: u64, parts_count: Option<u64> },
    /// A part's GET went on the wire.
    PartDownloading { part_no: u64 },
    /// A part's GET succeeded and its bytes are in memory.
    PartDownloaded { part_no: u64 },
    /// Emitted immediately before a part's bytes flow to the sink.
    PartWriting { part_no: u64 },
    /// The sink accepted the part (possibly still buffered downstream).
    PartDone { part_no: u64 },
}

impl DownloadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DownloadEvent::ObjectDownloading { .. } => EventKind::ObjectDownloading,
            DownloadEvent::PartDownloading { .. } => EventKind::PartDownloading,
            DownloadEvent::PartDownloaded { .. } => EventKind::PartDownloaded,
            DownloadEvent::PartWriting { .. } => EventKind::PartWriting,
            DownloadEvent::PartDone { .. } => EventKind::PartDone,
        }
    }

    /// The part number the event refers to, when it refers to one.
    pub fn part_no(&self) -> Option<u64> {
        match self {
            DownloadEvent::ObjectDownloading { .. } => None,
            DownloadEvent::PartDownloading { part_no }
            | DownloadEvent::PartDownloaded { part_no }
            | DownloadEvent::PartWriting { part_no }
            | DownloadEvent::PartDone { part_no } => Some(*part_no),
        }
    }
}

/// Handle returned by `on`/`once`, accepted by `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

struct Registered {
    id: u64,
    once: bool,
    listener: Listener,
}

/// Per-download listener registry.
///
/// Muted permanently once the download aborts: the abort transition is
/// monotonic, and no `part:*` event may be observed after it.
pub(crate) struct Emitter {
    listeners: Mutex<HashMap<EventKind, Vec<Registered>>>,
    next_id: AtomicU64,
    muted: AtomicBool,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            muted: AtomicBool::new(false),
        }
    }

    pub(crate) fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&DownloadEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(kind, false, Arc::new(listener))
    }

    pub(crate) fn once(
        &self,
        kind: EventKind,
        listener: impl Fn(&DownloadEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(kind, true, Arc::new(listener))
    }

    fn register(&self, kind: EventKind, once: bool, listener: Listener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        listeners.entry(kind).or_default().push(Registered { id, once, listener });
        ListenerId(id)
    }

    /// Remove a listener. Returns whether it was still registered.
    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|r| r.id == id.0) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Permanently suppress delivery.
    pub(crate) fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: &DownloadEvent) {
        if self.muted.load(Ordering::SeqCst) {
            return;
        }
        // Snapshot outside the callbacks so a listener may call on/off
        // without deadlocking; once-listeners are dropped before dispatch.
        let snapshot: Vec<Listener> = {
            let mut listeners = self.listeners.lock().expect("listener registry poisoned");
            match listeners.get_mut(&event.kind()) {
                Some(entries) => {
                    let snapshot = entries.iter().map(|r| r.listener.clone()).collect();
                    entries.retain(|r| !r.once);
                    snapshot
                }
                None => return,
            }
        };
        for listener in snapshot {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_listener(counter: Arc<AtomicUsize>) -> impl Fn(&DownloadEvent) + Send + Sync {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_on_receives_every_emission() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.on(EventKind::PartDone, counter_listener(hits.clone()));

        for part_no in 1..=3 {
            emitter.emit(&DownloadEvent::PartDone { part_no });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.once(EventKind::PartDone, counter_listener(hits.clone()));

        emitter.emit(&DownloadEvent::PartDone { part_no: 1 });
        emitter.emit(&DownloadEvent::PartDone { part_no: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_unregisters() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = emitter.on(EventKind::PartWriting, counter_listener(hits.clone()));

        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit(&DownloadEvent::PartWriting { part_no: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_muted_emitter_drops_events() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.on(EventKind::PartDownloaded, counter_listener(hits.clone()));

        emitter.mute();
        emitter.emit(&DownloadEvent::PartDownloaded { part_no: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_only_sees_its_kind() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.on(EventKind::PartDownloading, counter_listener(hits.clone()));

        emitter.emit(&DownloadEvent::PartDone { part_no: 1 });
        emitter.emit(&DownloadEvent::PartDownloading { part_no: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::ObjectDownloading.as_str(), "object:downloading");
        assert_eq!(EventKind::PartDownloading.as_str(), "part:downloading");
        assert_eq!(EventKind::PartDownloaded.as_str(), "part:downloaded");
        assert_eq!(EventKind::PartWriting.as_str(), "part:writing");
        assert_eq!(EventKind::PartDone.as_str(), "part:done");
    }
}
