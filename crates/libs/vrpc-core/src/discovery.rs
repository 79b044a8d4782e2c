use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent presence as carried by the retained, will-backed `__info__`
/// publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// Retained per-class discovery payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    #[serde(rename = "className")]
    pub class_name: String,
    pub instances: Vec<String>,
    #[serde(rename = "memberFunctions")]
    pub member_functions: Vec<String>,
    #[serde(rename = "staticFunctions")]
    pub static_functions: Vec<String>,
}

/// Retained agent-level presence payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub status: AgentStatus,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEntry {
    pub status: AgentStatus,
    pub hostname: String,
    pub classes: BTreeMap<String, ClassInfo>,
}

impl AgentEntry {
    /// Retained class info reaching us is itself a liveness signal, so an
    /// entry created before any agent-level info counts as online.
    fn new() -> Self {
        Self { status: AgentStatus::Online, hostname: String::new(), classes: BTreeMap::new() }
    }
}

/// The remote's eventually-consistent availability view:
/// domain → agent → (status, hostname, classes). The latest retained message
/// per (domain, agent, class) wins. Offline agents keep their entry so the
/// tree can report them as present-but-offline.
#[derive(Debug, Default)]
pub struct DiscoveryTree {
    domains: BTreeMap<String, BTreeMap<String, AgentEntry>>,
}

impl DiscoveryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the tree changed, which drives event emission.
    pub fn apply_class_info(&mut self, domain: &str, agent: &str, info: ClassInfo) -> bool {
        let entry = self
            .domains
            .entry(domain.to_owned())
            .or_default()
            .entry(agent.to_owned())
            .or_insert_with(AgentEntry::new);
        match entry.classes.get(&info.class_name) {
            Some(existing) if *existing == info => false,
            _ => {
                entry.classes.insert(info.class_name.clone(), info);
                true
            }
        }
    }

    pub fn apply_agent_info(&mut self, domain: &str, agent: &str, info: AgentInfo) -> bool {
        let entry = self
            .domains
            .entry(domain.to_owned())
            .or_default()
            .entry(agent.to_owned())
            .or_insert_with(AgentEntry::new);
        if entry.status == info.status && entry.hostname == info.hostname {
            return false;
        }
        entry.status = info.status;
        entry.hostname = info.hostname;
        true
    }

    /// Drops one class entry, e.g. when its retained info is cleared.
    pub fn clear_class(&mut self, domain: &str, agent: &str, klass: &str) -> bool {
        self.domains
            .get_mut(domain)
            .and_then(|agents| agents.get_mut(agent))
            .is_some_and(|entry| entry.classes.remove(klass).is_some())
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.keys().cloned().collect()
    }

    pub fn agents(&self, domain: &str) -> Vec<String> {
        self.domains.get(domain).map(|agents| agents.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn agent_entry(&self, domain: &str, agent: &str) -> Option<&AgentEntry> {
        self.domains.get(domain).and_then(|agents| agents.get(agent))
    }

    pub fn classes(&self, domain: &str, agent: &str) -> Vec<String> {
        self.agent_entry(domain, agent)
            .map(|entry| entry.classes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn class_info(&self, domain: &str, agent: &str, klass: &str) -> Option<&ClassInfo> {
        self.agent_entry(domain, agent).and_then(|entry| entry.classes.get(klass))
    }

    pub fn instances(&self, domain: &str, agent: &str, klass: &str) -> Vec<String> {
        self.class_info(domain, agent, klass).map(|info| info.instances.clone()).unwrap_or_default()
    }

    /// Member function names with overload tags stripped and deduplicated.
    pub fn member_functions(&self, domain: &str, agent: &str, klass: &str) -> Vec<String> {
        self.class_info(domain, agent, klass)
            .map(|info| stripped_names(&info.member_functions))
            .unwrap_or_default()
    }

    pub fn static_functions(&self, domain: &str, agent: &str, klass: &str) -> Vec<String> {
        self.class_info(domain, agent, klass)
            .map(|info| stripped_names(&info.static_functions))
            .unwrap_or_default()
    }
}

/// A signature is either a bare name or `name-<tag>`; the bare name is
/// everything before the first `-`.
pub fn strip_signature(name: &str) -> &str {
    match name.find('-') {
        Some(index) => &name[..index],
        None => name,
    }
}

/// Strips overload tags and deduplicates, preserving first-seen order.
pub fn stripped_names(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let bare = strip_signature(name);
        if !out.iter().any(|seen| seen == bare) {
            out.push(bare.to_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_info() -> ClassInfo {
        ClassInfo {
            class_name: "Counter".into(),
            instances: vec!["c1".into()],
            member_functions: vec![
                "increment".into(),
                "increment-number".into(),
                "on".into(),
            ],
            static_functions: vec!["version".into()],
        }
    }

    #[test]
    fn latest_class_info_wins() {
        let mut tree = DiscoveryTree::new();
        assert!(tree.apply_class_info("d", "a1", counter_info()));
        assert!(!tree.apply_class_info("d", "a1", counter_info()));

        let mut updated = counter_info();
        updated.instances.push("c2".into());
        assert!(tree.apply_class_info("d", "a1", updated));
        assert_eq!(tree.instances("d", "a1", "Counter"), vec!["c1", "c2"]);
    }

    #[test]
    fn member_functions_are_stripped_and_deduplicated() {
        let mut tree = DiscoveryTree::new();
        tree.apply_class_info("d", "a1", counter_info());
        assert_eq!(tree.member_functions("d", "a1", "Counter"), vec!["increment", "on"]);
    }

    #[test]
    fn class_info_alone_implies_an_online_agent() {
        let mut tree = DiscoveryTree::new();
        tree.apply_class_info("d", "a1", counter_info());
        let entry = tree.agent_entry("d", "a1").expect("entry");
        assert_eq!(entry.status, AgentStatus::Online);
    }

    #[test]
    fn offline_agent_keeps_its_entry() {
        let mut tree = DiscoveryTree::new();
        tree.apply_class_info("d", "a1", counter_info());
        let changed = tree.apply_agent_info(
            "d",
            "a1",
            AgentInfo { status: AgentStatus::Offline, hostname: "box".into() },
        );
        assert!(changed);
        assert_eq!(tree.agents("d"), vec!["a1"]);
        let entry = tree.agent_entry("d", "a1").expect("entry");
        assert_eq!(entry.status, AgentStatus::Offline);
        assert_eq!(tree.classes("d", "a1"), vec!["Counter"]);
    }

    #[test]
    fn agent_info_payload_shape() {
        let info = AgentInfo { status: AgentStatus::Online, hostname: "box".into() };
        let json = serde_json::to_string(&info).expect("encode");
        assert_eq!(json, "{\"status\":\"online\",\"hostname\":\"box\"}");
    }
}
