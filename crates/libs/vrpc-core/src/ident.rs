use rand_core::{OsRng, RngCore};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::wire::TUNNEL_PREFIX;

/// Correlation counters wrap at 2^53, the safe-integer bound of the wire
/// ecosystem this protocol interoperates with.
const COUNTER_MASK: u64 = (1 << 53) - 1;

/// Four hex chars of per-process randomness. Note the 16-bit space: two
/// remotes on the same host collide with birthday probability, which the
/// protocol tolerates but does not detect.
pub fn random_token() -> String {
    let mut bytes = [0u8; 2];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Best-effort host name. Falls back to `localhost` so topic construction
/// never fails.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Concatenation of stable host characteristics. Each probe is best-effort;
/// unavailable ones contribute an empty string so the id stays deterministic
/// per machine.
fn host_fingerprint() -> String {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0);
    let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_default();
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_owned())
        .unwrap_or_default();
    let totalmem = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| s.lines().next().map(str::to_owned))
        .unwrap_or_default();
    format!(
        "{}{}{}{}{}{}{}{}",
        std::env::consts::ARCH,
        cpus,
        home,
        hostname(),
        std::env::consts::OS,
        release,
        totalmem,
        std::env::consts::FAMILY,
    )
}

/// Broker-level client id, deterministic per machine and at most 23 bytes:
/// `"vrpcp" + instance + "X" + first 13 hex chars of MD5(fingerprint)`.
pub fn client_id(instance: &str) -> String {
    let digest = md5::compute(host_fingerprint().as_bytes());
    let digest_hex = format!("{digest:x}");
    format!("vrpcp{instance}X{}", &digest_hex[..13])
}

/// Monotonic correlation-id source, one per remote connection.
#[derive(Debug)]
pub struct CorrelationIds {
    instance: String,
    counter: AtomicU64,
}

impl CorrelationIds {
    pub fn new(instance: impl Into<String>) -> Self {
        Self { instance: instance.into(), counter: AtomicU64::new(0) }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
        format!("{}-{}", self.instance, n)
    }
}

/// Tunnel id routing a callback argument back to its remote:
/// `__f__{proxyId}-{method}-{argIndex}-{suffix}`.
pub fn tunnel_id(proxy_id: &str, method: &str, arg_index: usize, suffix: &str) -> String {
    format!("{TUNNEL_PREFIX}{proxy_id}-{method}-{arg_index}-{suffix}")
}

/// Prefix shared by every tunnel id of one proxy; used for teardown sweeps.
pub fn tunnel_proxy_prefix(proxy_id: &str) -> String {
    format!("{TUNNEL_PREFIX}{proxy_id}-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_is_four_hex_chars() {
        let token = random_token();
        assert_eq!(token.len(), 4);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn client_id_fits_broker_limit() {
        let id = client_id("abcd");
        assert!(id.len() <= 23, "client id too long: {id}");
        assert!(id.starts_with("vrpcpabcdX"));
    }

    #[test]
    fn client_id_is_stable_per_host() {
        assert_eq!(client_id("abcd"), client_id("abcd"));
    }

    #[test]
    fn correlation_ids_are_prefixed_and_monotonic() {
        let ids = CorrelationIds::new("ab12");
        assert_eq!(ids.next(), "ab12-0");
        assert_eq!(ids.next(), "ab12-1");
        assert_eq!(ids.instance(), "ab12");
    }

    #[test]
    fn tunnel_ids_carry_scope_method_and_index() {
        assert_eq!(tunnel_id("beef", "on", 1, "data"), "__f__beef-on-1-data");
        assert!(tunnel_id("beef", "notify", 2, "7").starts_with(&tunnel_proxy_prefix("beef")));
    }
}
