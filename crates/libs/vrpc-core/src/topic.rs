use crate::error::VrpcError;

/// Target segment for class-level (static) dispatch.
pub const STATIC_TARGET: &str = "__static__";
/// Pseudo class carrying agent-level presence.
pub const AGENT_CLASS: &str = "__agent__";
/// Retained discovery method segment.
pub const INFO_METHOD: &str = "__info__";

pub const CREATE_METHOD: &str = "__create__";
pub const CREATE_NAMED_METHOD: &str = "__createNamed__";
pub const GET_NAMED_METHOD: &str = "__getNamed__";
pub const DELETE_METHOD: &str = "__delete__";

/// Configuration-level wildcard accepted for domain and agent.
pub const ANY: &str = "*";

/// A parsed five-segment dispatch topic:
/// `{domain}/{agent}/{class}/{target}/{method}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub domain: String,
    pub agent: String,
    pub klass: String,
    pub target: String,
    pub method: String,
}

impl Topic {
    /// Parses a dispatch topic. Anything other than exactly five non-empty
    /// segments is a protocol violation.
    pub fn parse(raw: &str) -> Result<Self, VrpcError> {
        let segments: Vec<&str> = raw.split('/').collect();
        if segments.len() != 5 || segments.iter().any(|s| s.is_empty()) {
            return Err(VrpcError::protocol(format!(
                "dispatch topic must have five segments, got {raw:?}"
            )));
        }
        Ok(Self {
            domain: segments[0].to_owned(),
            agent: segments[1].to_owned(),
            klass: segments[2].to_owned(),
            target: segments[3].to_owned(),
            method: segments[4].to_owned(),
        })
    }

    pub fn render(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.domain, self.agent, self.klass, self.target, self.method
        )
    }

    pub fn is_static(&self) -> bool {
        self.target == STATIC_TARGET
    }

    pub fn is_info(&self) -> bool {
        self.method == INFO_METHOD
    }
}

pub fn static_topic(domain: &str, agent: &str, klass: &str, method: &str) -> String {
    format!("{domain}/{agent}/{klass}/{STATIC_TARGET}/{method}")
}

pub fn instance_topic(domain: &str, agent: &str, klass: &str, instance: &str, method: &str) -> String {
    format!("{domain}/{agent}/{klass}/{instance}/{method}")
}

pub fn class_info_topic(domain: &str, agent: &str, klass: &str) -> String {
    static_topic(domain, agent, klass, INFO_METHOD)
}

pub fn agent_info_topic(domain: &str, agent: &str) -> String {
    format!("{domain}/{agent}/{AGENT_CLASS}/{STATIC_TARGET}/{INFO_METHOD}")
}

/// Subscription filter covering all retained `__info__` publications for the
/// configured scope. `*` widens the corresponding level to `+`.
pub fn discovery_filter(domain: &str, agent: &str) -> String {
    let domain = if domain == ANY { "+" } else { domain };
    let agent = if agent == ANY { "+" } else { agent };
    format!("{domain}/{agent}/+/{STATIC_TARGET}/{INFO_METHOD}")
}

/// MQTT-style filter match: `+` spans one level, a trailing `#` spans the
/// rest. Used by the in-memory broker and for routing decisions.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return filter_parts.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_exactly_five_segments() {
        let topic = Topic::parse("d/a1/Foo/__static__/greet").expect("valid topic");
        assert_eq!(topic.domain, "d");
        assert_eq!(topic.klass, "Foo");
        assert!(topic.is_static());
        assert_eq!(topic.render(), "d/a1/Foo/__static__/greet");
    }

    #[test]
    fn parse_rejects_wrong_arity_and_empty_segments() {
        assert!(Topic::parse("d/a1/Foo/greet").is_err());
        assert!(Topic::parse("d/a1/Foo/__static__/greet/extra").is_err());
        assert!(Topic::parse("d//Foo/__static__/greet").is_err());
    }

    #[test]
    fn discovery_filter_widens_wildcards() {
        assert_eq!(discovery_filter("*", "*"), "+/+/+/__static__/__info__");
        assert_eq!(discovery_filter("d", "a1"), "d/a1/+/__static__/__info__");
    }

    #[test]
    fn filter_matching_covers_plus_and_hash() {
        assert!(matches_filter("d/+/+/__static__/__info__", "d/a1/Foo/__static__/__info__"));
        assert!(!matches_filter("d/+/+/__static__/__info__", "d/a1/Foo/c1/increment"));
        assert!(matches_filter("d/#", "d/a1/Foo/c1/increment"));
        assert!(matches_filter("d/hostname/abcd", "d/hostname/abcd"));
        assert!(!matches_filter("d/hostname/abcd", "d/hostname/abcd/__info__"));
        assert!(!matches_filter("d/a1/#", "e/a1/Foo"));
    }

    #[test]
    fn info_topics_follow_the_taxonomy() {
        assert_eq!(class_info_topic("d", "a1", "Foo"), "d/a1/Foo/__static__/__info__");
        assert_eq!(agent_info_topic("d", "a1"), "d/a1/__agent__/__static__/__info__");
    }
}
