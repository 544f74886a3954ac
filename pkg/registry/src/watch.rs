use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use pkg_constants::registry::{NODE_KEY_PREFIX, POD_KEY_PREFIX};

/// Which record a watch event is about, derived from its registry key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ObjectRef {
    Pod { namespace: String, name: String },
    Node { name: String },
    /// Keys outside the pod/node keyspace, e.g. the controller id.
    Other { key: String },
}

impl ObjectRef {
    pub fn from_key(key: &str) -> Self {
        if let Some(rest) = key.strip_prefix(POD_KEY_PREFIX) {
            if let Some((namespace, name)) = rest.split_once('/') {
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') {
                    return ObjectRef::Pod {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    };
                }
            }
        }
        if let Some(name) = key.strip_prefix(NODE_KEY_PREFIX) {
            if !name.is_empty() && !name.contains('/') {
                return ObjectRef::Node {
                    name: name.to_string(),
                };
            }
        }
        ObjectRef::Other {
            key: key.to_string(),
        }
    }
}

/// One committed registry mutation, as streamed to watchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub seq: u64,
    pub object: ObjectRef,
    /// Record version after the write; `None` for deletes.
    pub version: Option<u64>,
    /// Phase the written pod or node is in, when the object carries one.
    /// Lets watchers follow lifecycle transitions without deserializing
    /// the whole record.
    pub phase: Option<String>,
    /// The written object with the version envelope stripped; `None` for
    /// deletes.
    pub value: Option<serde_json::Value>,
    pub deleted: bool,
}

/// Watch log over registry mutations.
///
/// Every committed put/delete becomes a `RegistryEvent` with a monotonic
/// sequence number. A bounded ring of recent events lets late watchers
/// catch up from a known sequence number before switching to the live
/// broadcast feed.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<Ring>>,
    sender: broadcast::Sender<RegistryEvent>,
}

struct Ring {
    next_seq: u64,
    recent: VecDeque<RegistryEvent>,
    capacity: usize,
}

impl EventLog {
    /// Create an event log retaining up to `capacity` recent events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Ring {
                next_seq: 0,
                recent: VecDeque::with_capacity(capacity),
                capacity,
            })),
            sender,
        }
    }

    /// Record a committed write. `stored` is the `{version, obj}` envelope
    /// the store persisted; the event carries the inner object and, for
    /// pods and nodes, the phase it landed in.
    pub(crate) async fn record_put(&self, key: &str, stored: &[u8]) {
        let (version, value) = match serde_json::from_slice::<serde_json::Value>(stored) {
            Ok(envelope) => (
                envelope.get("version").and_then(|v| v.as_u64()),
                envelope.get("obj").cloned(),
            ),
            Err(_) => (None, None),
        };
        let phase = value
            .as_ref()
            .and_then(|obj| obj.get("status"))
            .and_then(|status| status.get("phase"))
            .and_then(|phase| phase.as_str())
            .map(str::to_string);
        self.push(RegistryEvent {
            seq: 0,
            object: ObjectRef::from_key(key),
            version,
            phase,
            value,
            deleted: false,
        })
        .await;
    }

    /// Record a committed delete.
    pub(crate) async fn record_delete(&self, key: &str) {
        self.push(RegistryEvent {
            seq: 0,
            object: ObjectRef::from_key(key),
            version: None,
            phase: None,
            value: None,
            deleted: true,
        })
        .await;
    }

    async fn push(&self, mut event: RegistryEvent) {
        let mut ring = self.inner.write().await;
        ring.next_seq += 1;
        event.seq = ring.next_seq;
        if ring.recent.len() == ring.capacity {
            ring.recent.pop_front();
        }
        ring.recent.push_back(event.clone());
        // Broadcast to subscribers (ignore errors if no receivers)
        let _ = self.sender.send(event);
    }

    /// Buffered events with a sequence number greater than `from_seq`,
    /// oldest first. Events older than the ring capacity are gone.
    pub async fn replay(&self, from_seq: u64) -> Vec<RegistryEvent> {
        self.inner
            .read()
            .await
            .recent
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    /// Subscribe to receive new events as they are committed.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_from_key() {
        assert_eq!(
            ObjectRef::from_key("/registry/pods/default/web"),
            ObjectRef::Pod {
                namespace: "default".to_string(),
                name: "web".to_string(),
            }
        );
        assert_eq!(
            ObjectRef::from_key("/registry/nodes/node-1a2b"),
            ObjectRef::Node {
                name: "node-1a2b".to_string(),
            }
        );
        assert_eq!(
            ObjectRef::from_key("/registry/controller-id"),
            ObjectRef::Other {
                key: "/registry/controller-id".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_put_event_carries_phase_and_object() {
        let log = EventLog::new(16);
        let stored = br#"{"version":3,"obj":{"name":"web","status":{"phase":"Running"}}}"#;
        log.record_put("/registry/pods/default/web", stored).await;

        let events = log.replay(0).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.seq, 1);
        assert_eq!(event.version, Some(3));
        assert_eq!(event.phase.as_deref(), Some("Running"));
        assert!(!event.deleted);
        assert_eq!(
            event.value.as_ref().unwrap().get("name").unwrap(),
            "web"
        );
    }

    #[tokio::test]
    async fn test_delete_event_has_no_payload() {
        let log = EventLog::new(16);
        log.record_delete("/registry/nodes/node-9").await;
        let events = log.replay(0).await;
        assert!(events[0].deleted);
        assert!(events[0].value.is_none());
        assert!(events[0].phase.is_none());
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest_and_replay_respects_seq() {
        let log = EventLog::new(2);
        for i in 0..3 {
            log.record_delete(&format!("/registry/nodes/n{}", i)).await;
        }
        let events = log.replay(0).await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(log.replay(2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_live_events() {
        let log = EventLog::new(16);
        let mut rx = log.subscribe();
        log.record_put("/registry/nodes/n1", br#"{"version":1,"obj":{}}"#)
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.object,
            ObjectRef::Node {
                name: "n1".to_string(),
            }
        );
    }
}
