//! Factory registry: per-factory worker caps and trim requests (C11,
//! spec.md §4.9), grounded on `factory_trim_workers` in `ds_manager.c`.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct FactoryLimits {
    pub min_workers: u32,
    pub max_workers: u32,
}

#[derive(Debug, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, FactoryLimits>,
    connected: HashMap<String, u32>,
}

impl FactoryRegistry {
    pub fn set_limits(&mut self, name: &str, limits: FactoryLimits) {
        self.factories.insert(name.to_string(), limits);
    }

    pub fn note_connected(&mut self, name: &str) {
        *self.connected.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn note_disconnected(&mut self, name: &str) {
        if let Some(count) = self.connected.get_mut(name) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn connected_count(&self, name: &str) -> u32 {
        *self.connected.get(name).unwrap_or(&0)
    }

    /// How many workers of this factory should be asked to retire right
    /// now because the registry is over its configured cap.
    pub fn excess_workers(&self, name: &str) -> u32 {
        let limits = match self.factories.get(name) {
            Some(l) => l,
            None => return 0,
        };
        self.connected_count(name).saturating_sub(limits.max_workers)
    }

    /// Names of every factory currently over its cap, each paired with
    /// how many workers must be trimmed.
    pub fn factories_needing_trim(&self) -> Vec<(String, u32)> {
        self.factories
            .keys()
            .filter_map(|name| {
                let excess = self.excess_workers(name);
                if excess > 0 {
                    Some((name.clone(), excess))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excess_workers_is_zero_under_cap() {
        let mut reg = FactoryRegistry::default();
        reg.set_limits("pool-a", FactoryLimits { min_workers: 0, max_workers: 5 });
        for _ in 0..3 {
            reg.note_connected("pool-a");
        }
        assert_eq!(reg.excess_workers("pool-a"), 0);
    }

    #[test]
    fn excess_workers_counts_overflow() {
        let mut reg = FactoryRegistry::default();
        reg.set_limits("pool-a", FactoryLimits { min_workers: 0, max_workers: 2 });
        for _ in 0..5 {
            reg.note_connected("pool-a");
        }
        assert_eq!(reg.excess_workers("pool-a"), 3);
    }
}
