use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RuntimeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    Pipestance(PipestanceEvent),
    Unit(UnitEvent),
    Vdr(VdrEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipestanceEvent {
    Started {
        psid: String,
        path: String,
    },
    Reattached {
        psid: String,
        path: String,
    },
    Completed {
        psid: String,
    },
    Failed {
        psid: String,
        fqname: String,
        classification: String,
        will_retry: bool,
    },
    Retrying {
        psid: String,
        attempt: u32,
        delay_ms: u64,
    },
    Killed {
        psid: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitEvent {
    Submitted {
        fqname: String,
        phase: String,
        threads: u32,
        mem_gb: Option<u32>,
    },
    StateChanged {
        fqname: String,
        from: Option<String>,
        to: String,
    },
    Reset {
        fqname: String,
    },
    TimedOut {
        fqname: String,
        idle_secs: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VdrEvent {
    Completed {
        psid: String,
        count: u64,
        size: u64,
    },
}

pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event);
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    observer: Option<SharedRuntimeEventObserver>,
    sender: Option<RuntimeEventSender>,
    sequence: Arc<AtomicU64>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }

    /// Stamps `kind` with the next sequence number and the current time.
    pub fn publish(&self, kind: RuntimeEventKind) {
        if !self.is_enabled() {
            return;
        }
        let sequence_no = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.emit(RuntimeEvent {
            sequence_no,
            timestamp: pipestance_store::timestamp_now(),
            kind,
        });
    }

    pub fn pipestance(&self, event: PipestanceEvent) {
        self.publish(RuntimeEventKind::Pipestance(event));
    }

    pub fn unit(&self, event: UnitEvent) {
        self.publish(RuntimeEventKind::Unit(event));
    }

    pub fn vdr(&self, event: VdrEvent) {
        self.publish(RuntimeEventKind::Vdr(event));
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn runtime_event_sink_observer_and_sender_expected_both_receive_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let observer: SharedRuntimeEventObserver = Arc::new(move |event: &RuntimeEvent| {
            observer_seen
                .lock()
                .expect("observer mutex should lock")
                .push(event.sequence_no);
        });
        let (tx, mut rx) = runtime_event_channel();
        let sink = RuntimeEventSink::with_observer(observer).sender(tx);
        sink.pipestance(PipestanceEvent::Started {
            psid: "ps1".to_string(),
            path: "/tmp/ps1".to_string(),
        });
        sink.unit(UnitEvent::Reset {
            fqname: "ID.ps1.PIPE.A".to_string(),
        });

        let first = rx.try_recv().expect("channel should receive first event");
        let second = rx.try_recv().expect("channel should receive second event");
        assert_eq!((first.sequence_no, second.sequence_no), (1, 2));
        assert!(matches!(
            second.kind,
            RuntimeEventKind::Unit(UnitEvent::Reset { .. })
        ));
        assert_eq!(
            seen.lock().expect("observer mutex should lock").as_slice(),
            &[1, 2]
        );
    }

    #[test]
    fn runtime_event_kind_serializes_with_category_and_kind_tags() {
        let kind = RuntimeEventKind::Vdr(VdrEvent::Completed {
            psid: "ps1".to_string(),
            count: 3,
            size: 42,
        });
        let value = serde_json::to_value(&kind).expect("event should serialize");
        assert_eq!(value["category"], "vdr");
        assert_eq!(value["kind"], "completed");
        assert_eq!(value["size"], 42);
    }
}
