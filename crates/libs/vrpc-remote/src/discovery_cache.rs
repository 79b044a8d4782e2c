use std::sync::Mutex;

use log::warn;
use tokio::sync::broadcast;
use vrpc_core::discovery::{AgentInfo, AgentStatus, ClassInfo, DiscoveryTree};
use vrpc_core::topic::{Topic, AGENT_CLASS};

/// Change notifications derived from retained `__info__` traffic.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    Agent { domain: String, agent: String, status: AgentStatus, hostname: String },
    Class { domain: String, agent: String, info: ClassInfo },
}

/// Owns the availability tree. Only the inbound pump mutates it; observers
/// snapshot or subscribe to events. Parse failures are logged and ignored,
/// background traffic never raises to callers.
pub struct DiscoveryCache {
    tree: Mutex<DiscoveryTree>,
    events: broadcast::Sender<RemoteEvent>,
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self { tree: Mutex::new(DiscoveryTree::new()), events }
    }
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    /// Applies one retained `__info__` message. The special `__agent__`
    /// class carries agent presence; everything else is class info. An empty
    /// payload clears the retained class entry.
    pub fn apply_info(&self, topic: &Topic, payload: &[u8]) {
        if topic.klass == AGENT_CLASS {
            let info: AgentInfo = match serde_json::from_slice(payload) {
                Ok(info) => info,
                Err(err) => {
                    warn!("ignoring malformed agent info on {}: {err}", topic.render());
                    return;
                }
            };
            let changed = {
                let mut tree = self.tree.lock().expect("tree mutex poisoned");
                tree.apply_agent_info(&topic.domain, &topic.agent, info.clone())
            };
            if changed {
                let _ = self.events.send(RemoteEvent::Agent {
                    domain: topic.domain.clone(),
                    agent: topic.agent.clone(),
                    status: info.status,
                    hostname: info.hostname,
                });
            }
            return;
        }

        if payload.is_empty() {
            let mut tree = self.tree.lock().expect("tree mutex poisoned");
            tree.clear_class(&topic.domain, &topic.agent, &topic.klass);
            return;
        }
        let info: ClassInfo = match serde_json::from_slice(payload) {
            Ok(info) => info,
            Err(err) => {
                warn!("ignoring malformed class info on {}: {err}", topic.render());
                return;
            }
        };
        let changed = {
            let mut tree = self.tree.lock().expect("tree mutex poisoned");
            tree.apply_class_info(&topic.domain, &topic.agent, info.clone())
        };
        if changed {
            let _ = self.events.send(RemoteEvent::Class {
                domain: topic.domain.clone(),
                agent: topic.agent.clone(),
                info,
            });
        }
    }

    /// Read access to the tree; callers get a consistent snapshot for the
    /// duration of the closure.
    pub fn snapshot<R>(&self, f: impl FnOnce(&DiscoveryTree) -> R) -> R {
        let tree = self.tree.lock().expect("tree mutex poisoned");
        f(&tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrpc_core::topic;

    fn info_topic(raw: &str) -> Topic {
        Topic::parse(raw).expect("topic")
    }

    fn class_payload() -> Vec<u8> {
        serde_json::to_vec(&ClassInfo {
            class_name: "Counter".into(),
            instances: vec![],
            member_functions: vec!["increment".into()],
            static_functions: vec![],
        })
        .expect("encode")
    }

    #[test]
    fn class_info_updates_tree_and_emits_once() {
        let cache = DiscoveryCache::new();
        let mut events = cache.subscribe();
        let topic = info_topic("d/a1/Counter/__static__/__info__");

        cache.apply_info(&topic, &class_payload());
        cache.apply_info(&topic, &class_payload());

        assert_eq!(cache.snapshot(|tree| tree.classes("d", "a1")), vec!["Counter"]);
        assert!(matches!(events.try_recv(), Ok(RemoteEvent::Class { .. })));
        assert!(events.try_recv().is_err(), "unchanged info must not re-emit");
    }

    #[test]
    fn agent_presence_routes_through_the_agent_class() {
        let cache = DiscoveryCache::new();
        let mut events = cache.subscribe();
        let raw = topic::agent_info_topic("d", "a1");
        let payload = b"{\"status\":\"offline\",\"hostname\":\"box\"}";

        cache.apply_info(&info_topic(&raw), payload);
        match events.try_recv() {
            Ok(RemoteEvent::Agent { status, hostname, .. }) => {
                assert_eq!(status, AgentStatus::Offline);
                assert_eq!(hostname, "box");
            }
            other => panic!("expected agent event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let cache = DiscoveryCache::new();
        let topic = info_topic("d/a1/Counter/__static__/__info__");
        cache.apply_info(&topic, b"not json");
        assert!(cache.snapshot(|tree| tree.domains()).is_empty());
    }

    #[test]
    fn empty_payload_clears_the_class() {
        let cache = DiscoveryCache::new();
        let topic = info_topic("d/a1/Counter/__static__/__info__");
        cache.apply_info(&topic, &class_payload());
        cache.apply_info(&topic, b"");
        assert!(cache.snapshot(|tree| tree.classes("d", "a1")).is_empty());
    }
}
