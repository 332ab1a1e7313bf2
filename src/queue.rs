//! Temperature-classified priority queue for transcript files.
//!
//! Files are classified by modification age: HOT files (active
//! conversations) jump the queue and tighten the loop cadence, WARM files
//! wait for the normal cycle, COLD files trickle in a few per cycle. A
//! WARM file that has waited longer than `max_warm_wait` is promoted to
//! URGENT_WARM so a steady stream of HOT arrivals can never starve it.
//!
//! The queue is a bounded deque plus a dedup set keyed by absolute path.
//! A path stays in the dedup set while its processing attempt is in
//! flight; re-discoveries during that window are ignored.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

/// Urgency class derived from modification age and queue wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperature {
    Hot,
    UrgentWarm,
    Warm,
    Cold,
}

impl Temperature {
    /// Classify by age alone; URGENT_WARM only arises later by promotion.
    pub fn classify(age: Duration, hot_window: Duration, warm_window: Duration) -> Self {
        if age < hot_window {
            Temperature::Hot
        } else if age < warm_window {
            Temperature::Warm
        } else {
            Temperature::Cold
        }
    }

    /// Base priority; lower is more urgent. WARM files from a project
    /// other than the one currently being worked are nudged back so a
    /// project's backlog drains contiguously.
    pub fn base_priority(self, different_project: bool) -> u64 {
        match self {
            Temperature::Hot => 0,
            Temperature::UrgentWarm => 1,
            Temperature::Warm => {
                if different_project {
                    3
                } else {
                    2
                }
            }
            Temperature::Cold => 4,
        }
    }
}

/// One queued transcript file.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub path: PathBuf,
    pub resume_from: u64,
    pub mtime_epoch: f64,
    pub temperature: Temperature,
    /// Age in minutes at classification time, clamped into the priority key.
    pub age_minutes: u64,
    pub enqueued_at: Instant,
    pub different_project: bool,
}

impl QueueEntry {
    /// Final dispatch key: `base * 10_000 + min(age_minutes, 9999)`.
    pub fn priority(&self) -> u64 {
        self.temperature.base_priority(self.different_project) * 10_000
            + self.age_minutes.min(9_999)
    }
}

/// Bounded deque + dedup set.
pub struct IngestQueue {
    entries: VecDeque<QueueEntry>,
    dedup: HashSet<PathBuf>,
    max: usize,
}

impl IngestQueue {
    pub fn new(max: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            dedup: HashSet::new(),
            max,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.dedup.contains(path)
    }

    pub fn has_hot(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.temperature, Temperature::Hot | Temperature::UrgentWarm))
    }

    /// Enqueue unless the path is already queued or in flight. Returns
    /// whether the entry was admitted.
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        if self.dedup.contains(&entry.path) {
            return false;
        }

        if self.entries.len() >= self.max {
            match entry.temperature {
                Temperature::Cold => {
                    warn!(path = %entry.path.display(), "queue full; deferring cold file");
                    return false;
                }
                Temperature::Hot => {
                    // Make room by evicting the oldest COLD entry; it will
                    // be re-discovered on a later scan.
                    if let Some(pos) = self
                        .entries
                        .iter()
                        .rposition(|e| e.temperature == Temperature::Cold)
                    {
                        let evicted = self.entries.remove(pos).unwrap();
                        self.dedup.remove(&evicted.path);
                        warn!(path = %evicted.path.display(), "queue full; evicted cold file for hot");
                    }
                }
                _ => {}
            }
        }

        self.dedup.insert(entry.path.clone());
        match entry.temperature {
            Temperature::Hot | Temperature::UrgentWarm => self.entries.push_front(entry),
            _ => self.entries.push_back(entry),
        }
        true
    }

    /// Promote WARM entries that have waited past `max_warm_wait`.
    pub fn promote_stale(&mut self, max_warm_wait: Duration) {
        for entry in &mut self.entries {
            if entry.temperature == Temperature::Warm
                && entry.enqueued_at.elapsed() > max_warm_wait
            {
                entry.temperature = Temperature::UrgentWarm;
            }
        }
    }

    /// Take the most urgent entry: lowest priority key, ties broken by
    /// the longest queue wait. The path stays in the dedup set until
    /// [`complete`](Self::complete) is called for it.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let mut best = 0usize;
        for (i, entry) in self.entries.iter().enumerate() {
            let (bp, be) = (self.entries[best].priority(), self.entries[best].enqueued_at);
            if entry.priority() < bp || (entry.priority() == bp && entry.enqueued_at < be) {
                best = i;
            }
        }
        self.entries.remove(best)
    }

    /// Release the dedup claim after a processing attempt finishes
    /// (success or failure), allowing the path to be re-enqueued.
    pub fn complete(&mut self, path: &Path) {
        self.dedup.remove(path);
    }

    /// Drop a path entirely (file disappeared).
    pub fn forget(&mut self, path: &Path) {
        self.entries.retain(|e| e.path != path);
        self.dedup.remove(path);
    }
}
