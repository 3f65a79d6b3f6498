//! Per-uop-kind execution counters consumed by the adaptive specialization policy.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::uop::UopKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UopCounters {
    counts: [u64; UopKind::COUNT],
}

impl Default for UopCounters {
    fn default() -> Self {
        Self {
            counts: [0; UopKind::COUNT],
        }
    }
}

/// Serializable view of [`UopCounters`]; kinds that never executed are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UopCountersSnapshot {
    pub total: u64,
    pub counts: BTreeMap<&'static str, u64>,
}

impl UopCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: UopKind) {
        let slot = &mut self.counts[kind as usize];
        *slot = slot.saturating_add(1);
    }

    pub fn get(&self, kind: UopKind) -> u64 {
        self.counts[kind as usize]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    pub fn merge(&mut self, other: &UopCounters) {
        for (dst, src) in self.counts.iter_mut().zip(other.counts.iter()) {
            *dst = dst.saturating_add(*src);
        }
    }

    pub fn reset(&mut self) {
        self.counts = [0; UopKind::COUNT];
    }

    pub fn snapshot(&self) -> UopCountersSnapshot {
        let counts = UopKind::ALL
            .iter()
            .filter(|kind| self.get(**kind) != 0)
            .map(|kind| (kind.name(), self.get(*kind)))
            .collect();
        UopCountersSnapshot {
            total: self.total(),
            counts,
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}
