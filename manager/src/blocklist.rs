//! Time-bounded host blocking (C11, spec.md §4.9), grounded on
//! `ds_block_host_with_timeout` in `ds_manager.c`.

use std::collections::HashMap;

use shared::utils::Timestamp;

#[derive(Debug, Clone, Copy)]
pub struct BlockEntry {
    pub blocked_at: Timestamp,
    /// `None` means blocked indefinitely (manual `block_host`, no
    /// timeout); `Some(t)` is the absolute unblock time.
    pub unblock_at: Option<Timestamp>,
    pub times_blocked: u32,
}

#[derive(Debug, Default)]
pub struct Blocklist {
    hosts: HashMap<String, BlockEntry>,
}

impl Blocklist {
    pub fn block(&mut self, host: &str, now: Timestamp, timeout_secs: Option<u64>) {
        let entry = self.hosts.entry(host.to_string()).or_insert(BlockEntry {
            blocked_at: now,
            unblock_at: None,
            times_blocked: 0,
        });
        entry.blocked_at = now;
        entry.unblock_at = timeout_secs.map(|t| now + t);
        entry.times_blocked += 1;
    }

    pub fn unblock(&mut self, host: &str) -> bool {
        self.hosts.remove(host).is_some()
    }

    pub fn unblock_all(&mut self) {
        self.hosts.clear();
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.hosts.contains_key(host)
    }

    /// Drop expired entries, returning the hosts that were released so
    /// the caller can log it.
    pub fn sweep_expired(&mut self, now: Timestamp) -> Vec<String> {
        let expired: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, e)| matches!(e.unblock_at, Some(t) if t <= now))
            .map(|(host, _)| host.clone())
            .collect();
        for host in &expired {
            self.hosts.remove(host);
        }
        expired
    }

    pub fn blocked_hosts(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    /// Back off the retry timeout exponentially on repeat offenses, the
    /// way the original doubles the slow-workers block window each time
    /// the same host reoffends within the observation period.
    pub fn next_timeout_secs(&self, host: &str, base_secs: u64) -> u64 {
        match self.hosts.get(host) {
            Some(entry) => base_secs.saturating_mul(1 << entry.times_blocked.min(16)),
            None => base_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_expired_releases_only_past_due_hosts() {
        let mut bl = Blocklist::default();
        bl.block("a.example", 100, Some(10));
        bl.block("b.example", 100, None);
        let released = bl.sweep_expired(111);
        assert_eq!(released, vec!["a.example".to_string()]);
        assert!(bl.is_blocked("b.example"));
    }

    #[test]
    fn repeat_offenses_double_the_timeout() {
        let mut bl = Blocklist::default();
        bl.block("flaky.example", 0, Some(60));
        let t1 = bl.next_timeout_secs("flaky.example", 60);
        bl.block("flaky.example", 0, Some(t1));
        let t2 = bl.next_timeout_secs("flaky.example", 60);
        assert!(t2 > t1);
    }
}
