use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

/// Electrum scripthash: SHA-256 of the output script, in the reversed (wire)
/// byte order clients send. Computed by the index backend at ingestion time;
/// everything here only ever receives the 32 raw bytes.
pub type ScriptHash = [u8; 32];

/// Cap breaches surface to the offending client as protocol errors; nothing
/// is recorded on breach.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscribeError {
    GlobalLimit,
    PerIpLimit,
}

impl SubscribeError {
    pub fn message(self) -> &'static str {
        match self {
            Self::GlobalLimit => "subscription limit reached (server)",
            Self::PerIpLimit => "subscription limit reached (per-IP)",
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_hash: HashMap<ScriptHash, HashSet<u64>>,
    by_session: HashMap<u64, HashSet<ScriptHash>>,
    by_ip: HashMap<IpAddr, usize>,
    session_ip: HashMap<u64, IpAddr>,
    total: usize,
}

/// Scripthash -> session-id mapping under one mutex (one of the two
/// shared-write structures in the process; the other is the pool queue).
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    max_globally: usize,
    max_per_ip: usize,
}

impl SubscriptionRegistry {
    pub fn new(max_globally: usize, max_per_ip: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_globally,
            max_per_ip,
        }
    }

    /// Record a subscription. `exempt` IPs (per-IP-limit exclusion subnets)
    /// skip the per-IP cap but still count toward the global one. Returns
    /// whether the entry is new for this session.
    pub fn subscribe(
        &self,
        session_id: u64,
        ip: IpAddr,
        hash: ScriptHash,
        exempt: bool,
    ) -> Result<bool, SubscribeError> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return Err(SubscribeError::GlobalLimit),
        };
        if inner
            .by_session
            .get(&session_id)
            .map(|set| set.contains(&hash))
            .unwrap_or(false)
        {
            return Ok(false);
        }
        if inner.total >= self.max_globally {
            return Err(SubscribeError::GlobalLimit);
        }
        if !exempt {
            let ip_count = inner.by_ip.get(&ip).copied().unwrap_or(0);
            if ip_count >= self.max_per_ip {
                return Err(SubscribeError::PerIpLimit);
            }
        }
        inner.by_hash.entry(hash).or_default().insert(session_id);
        inner.by_session.entry(session_id).or_default().insert(hash);
        inner.session_ip.insert(session_id, ip);
        *inner.by_ip.entry(ip).or_insert(0) += 1;
        inner.total += 1;
        Ok(true)
    }

    pub fn unsubscribe(&self, session_id: u64, hash: &ScriptHash) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let removed = inner
            .by_session
            .get_mut(&session_id)
            .map(|set| set.remove(hash))
            .unwrap_or(false);
        if !removed {
            return false;
        }
        if let Some(sessions) = inner.by_hash.get_mut(hash) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                inner.by_hash.remove(hash);
            }
        }
        if let Some(ip) = inner.session_ip.get(&session_id).copied() {
            if let Some(count) = inner.by_ip.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.by_ip.remove(&ip);
                }
            }
        }
        inner.total = inner.total.saturating_sub(1);
        true
    }

    /// Drop every entry belonging to a session (teardown sweep). Returns the
    /// number of subscriptions removed.
    pub fn remove_session(&self, session_id: u64) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return 0,
        };
        let Some(hashes) = inner.by_session.remove(&session_id) else {
            inner.session_ip.remove(&session_id);
            return 0;
        };
        let removed = hashes.len();
        for hash in hashes {
            if let Some(sessions) = inner.by_hash.get_mut(&hash) {
                sessions.remove(&session_id);
                if sessions.is_empty() {
                    inner.by_hash.remove(&hash);
                }
            }
        }
        if let Some(ip) = inner.session_ip.remove(&session_id) {
            if let Some(count) = inner.by_ip.get_mut(&ip) {
                *count = count.saturating_sub(removed);
                if *count == 0 {
                    inner.by_ip.remove(&ip);
                }
            }
        }
        inner.total = inner.total.saturating_sub(removed);
        removed
    }

    pub fn all_hashes(&self) -> Vec<ScriptHash> {
        self.inner
            .lock()
            .map(|inner| inner.by_hash.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn sessions_for(&self, hash: &ScriptHash) -> Vec<u64> {
        match self.inner.lock() {
            Ok(inner) => inner
                .by_hash
                .get(hash)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn session_subs(&self, session_id: u64) -> usize {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .by_session
                    .get(&session_id)
                    .map(HashSet::len)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.inner.lock().map(|inner| inner.total).unwrap_or(0)
    }

    pub fn unique_scripthashes(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.by_hash.len())
            .unwrap_or(0)
    }

    pub fn max_globally(&self) -> usize {
        self.max_globally
    }

    pub fn max_per_ip(&self) -> usize {
        self.max_per_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> ScriptHash {
        let mut h = [0u8; 32];
        h[0] = n;
        h
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 0, last])
    }

    #[test]
    fn subscribe_and_sweep() {
        let reg = SubscriptionRegistry::new(100, 10);
        assert_eq!(reg.subscribe(1, ip(1), hash(1), false), Ok(true));
        assert_eq!(reg.subscribe(1, ip(1), hash(1), false), Ok(false));
        assert_eq!(reg.subscribe(2, ip(2), hash(1), false), Ok(true));
        assert_eq!(reg.total(), 2);
        assert_eq!(reg.unique_scripthashes(), 1);
        let mut sessions = reg.sessions_for(&hash(1));
        sessions.sort_unstable();
        assert_eq!(sessions, vec![1, 2]);

        assert_eq!(reg.remove_session(1), 1);
        assert_eq!(reg.total(), 1);
        assert_eq!(reg.sessions_for(&hash(1)), vec![2]);
        assert_eq!(reg.remove_session(1), 0);
    }

    #[test]
    fn per_ip_cap_is_enforced() {
        let reg = SubscriptionRegistry::new(100, 2);
        assert_eq!(reg.subscribe(1, ip(1), hash(1), false), Ok(true));
        assert_eq!(reg.subscribe(1, ip(1), hash(2), false), Ok(true));
        assert_eq!(
            reg.subscribe(1, ip(1), hash(3), false),
            Err(SubscribeError::PerIpLimit)
        );
        // Breach records nothing.
        assert_eq!(reg.session_subs(1), 2);
        // A different IP is unaffected.
        assert_eq!(reg.subscribe(2, ip(2), hash(3), false), Ok(true));
        // Exempt IPs skip the per-IP cap.
        assert_eq!(reg.subscribe(1, ip(1), hash(4), true), Ok(true));
    }

    #[test]
    fn global_cap_is_enforced() {
        let reg = SubscriptionRegistry::new(2, 100);
        assert_eq!(reg.subscribe(1, ip(1), hash(1), false), Ok(true));
        assert_eq!(reg.subscribe(2, ip(2), hash(2), false), Ok(true));
        assert_eq!(
            reg.subscribe(3, ip(3), hash(3), false),
            Err(SubscribeError::GlobalLimit)
        );
        // Exemption does not bypass the global cap.
        assert_eq!(
            reg.subscribe(3, ip(3), hash(3), true),
            Err(SubscribeError::GlobalLimit)
        );
        assert_eq!(reg.total(), 2);
    }

    #[test]
    fn unsubscribe_releases_capacity() {
        let reg = SubscriptionRegistry::new(1, 1);
        assert_eq!(reg.subscribe(1, ip(1), hash(1), false), Ok(true));
        assert!(reg.unsubscribe(1, &hash(1)));
        assert!(!reg.unsubscribe(1, &hash(1)));
        assert_eq!(reg.total(), 0);
        assert_eq!(reg.subscribe(1, ip(1), hash(2), false), Ok(true));
    }
}
