//! Book-keeping of what the daemon has launched against each target.
//!
//! Entries expire on their own once their expected completion has passed, so
//! the scheduler never has to scan running processes to know whether a target
//! is still being worked.

use std::collections::HashMap;

use binary_heap_plus::{
    BinaryHeap,
    MinComparator,
};
use compact_str::CompactString;
use decorum::N64;
use log::debug;
use smallvec::SmallVec;

use crate::oracle::Pid;

/// Grace period after an expected completion before an entry is dropped.
const EXPIRY_GRACE: f64 = 500.;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkMode {
    Prep,
    Batch,
    Xp,
}

impl WorkMode {
    pub fn tag(&self) -> &'static str {
        use WorkMode::*;

        match self {
            Prep => "prep",
            Batch => "batch",
            Xp => "xp",
        }
    }
}

#[derive(Clone, Debug)]
struct WorkEntry {
    mode: WorkMode,
    completes_at: f64,
    pids: SmallVec<[Pid; 8]>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Expiry {
    at: N64,
    target: CompactString,
    mode: WorkMode,
}

pub struct WorkRegistry {
    entries: HashMap<CompactString, Vec<WorkEntry>>,
    expiries: BinaryHeap<Expiry, MinComparator>,
}

impl Default for WorkRegistry {
    fn default() -> WorkRegistry {
        WorkRegistry::new()
    }
}

impl WorkRegistry {
    pub fn new() -> WorkRegistry {
        WorkRegistry {
            entries: HashMap::new(),
            expiries: BinaryHeap::new_min(),
        }
    }

    /// Records work against a target. A later record for the same target and
    /// mode extends the existing one.
    pub fn record(
        &mut self,
        target: &str,
        mode: WorkMode,
        completes_at: f64,
        pids: impl IntoIterator<Item = Pid>,
    ) {
        let completes_at = match completes_at.is_finite() {
            true => completes_at,
            false => 0.,
        };

        let entries = self.entries.entry(CompactString::from(target)).or_default();
        match entries.iter_mut().find(|e| e.mode == mode) {
            Some(entry) => {
                entry.completes_at = entry.completes_at.max(completes_at);
                entry.pids.extend(pids);
            },
            None => entries.push(WorkEntry {
                mode,
                completes_at,
                pids: pids.into_iter().collect(),
            }),
        }

        self.expiries.push(Expiry {
            at: N64::from_inner(completes_at + EXPIRY_GRACE),
            target: CompactString::from(target),
            mode,
        });
    }

    pub fn is_being_worked(
        &self,
        target: &str,
        mode: WorkMode,
    ) -> bool {
        self.entries
            .get(target)
            .map_or(false, |entries| entries.iter().any(|e| e.mode == mode))
    }

    pub fn completion_of(
        &self,
        target: &str,
        mode: WorkMode,
    ) -> Option<f64> {
        self.entries
            .get(target)?
            .iter()
            .find(|e| e.mode == mode)
            .map(|e| e.completes_at)
    }

    /// Distinct targets with work of a mode in flight.
    pub fn count(
        &self,
        mode: WorkMode,
    ) -> usize {
        self.entries
            .values()
            .filter(|entries| entries.iter().any(|e| e.mode == mode))
            .count()
    }

    /// Slowest outstanding completion of any work.
    pub fn latest_completion(&self) -> Option<f64> {
        self.entries
            .values()
            .flatten()
            .map(|e| e.completes_at)
            .reduce(f64::max)
    }

    /// Drops an entry, returning the processes it held.
    pub fn forget(
        &mut self,
        target: &str,
        mode: WorkMode,
    ) -> SmallVec<[Pid; 8]> {
        let Some(entries) = self.entries.get_mut(target)
        else {
            return SmallVec::new();
        };

        let pids = match entries.iter().position(|e| e.mode == mode) {
            Some(pos) => entries.swap_remove(pos).pids,
            None => SmallVec::new(),
        };

        if entries.is_empty() {
            self.entries.remove(target);
        }

        pids
    }

    /// Drops every entry whose completion passed before `now`. Returns how
    /// many were dropped.
    pub fn expire(
        &mut self,
        now: f64,
    ) -> usize {
        let mut expired = 0;

        while let Some(next) = self.expiries.peek() {
            if N64::from_inner(now) < next.at {
                break;
            }

            let Some(expiry) = self.expiries.pop()
            else {
                break;
            };

            // stale heap item if the entry was extended since
            let due = self
                .completion_of(&expiry.target, expiry.mode)
                .map_or(false, |at| at + EXPIRY_GRACE <= now);

            if due {
                debug!("{} on {} completed", expiry.mode.tag(), expiry.target);
                self.forget(&expiry.target, expiry.mode);
                expired += 1;
            }
        }

        expired
    }
}
