use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use tokio::task::AbortHandle;

use super::RequestKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInsertOutcome {
    /// Entry was created; the caller starts the attempt task.
    Inserted { generation: u64 },
    /// A live entry with the same key exists; the waiter was attached to it.
    Joined { generation: u64 },
}

impl PendingInsertOutcome {
    pub fn generation(self) -> u64 {
        match self {
            PendingInsertOutcome::Inserted { generation }
            | PendingInsertOutcome::Joined { generation } => generation,
        }
    }
}

/// An entry removed because its deadline passed.
#[derive(Debug)]
pub struct PendingExpired<W> {
    pub key: RequestKey,
    pub attempts: u32,
    pub waiters: Vec<W>,
    pub task: Option<AbortHandle>,
}

/// Result of a waiter detaching from an entry.
#[derive(Debug)]
pub enum Detached {
    /// The entry is gone or the waiter was already completed.
    NotFound,
    Remaining(usize),
    /// The last waiter left; the entry was removed and its attempt task should be aborted.
    Last { task: Option<AbortHandle> },
}

#[derive(Debug)]
struct PendingEntry<W> {
    generation: u64,
    deadline: Instant,
    waiters: Vec<(u64, W)>,
    task: Option<AbortHandle>,
    attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DeadlineItem {
    deadline: Instant,
    generation: u64,
    key: RequestKey,
}

/// In-flight unary calls keyed by method and canonical params; at most one entry per key.
///
/// Each entry carries a generation so a completion or detach aimed at a replaced entry is a
/// no-op.
#[derive(Debug)]
pub struct PendingTable<W> {
    entries: HashMap<RequestKey, PendingEntry<W>>,
    deadlines: BinaryHeap<Reverse<DeadlineItem>>,
    next_generation: u64,
}

impl<W> Default for PendingTable<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> PendingTable<W> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_generation: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn waiter_count(&self, key: &RequestKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.waiters.len())
    }

    /// Join a live entry or create a new one. An entry past its deadline is evicted and handed
    /// back so the caller can fail its waiters.
    pub fn insert_or_join(
        &mut self,
        key: &RequestKey,
        now: Instant,
        deadline: Instant,
        waiter_id: u64,
        waiter: W,
    ) -> (PendingInsertOutcome, Option<PendingExpired<W>>) {
        let mut evicted = None;
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.deadline > now {
                entry.waiters.push((waiter_id, waiter));
                return (
                    PendingInsertOutcome::Joined {
                        generation: entry.generation,
                    },
                    None,
                );
            }
            evicted = self
                .entries
                .remove_entry(key)
                .map(|(key, entry)| Self::into_expired(key, entry));
        }

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        self.entries.insert(
            key.clone(),
            PendingEntry {
                generation,
                deadline,
                waiters: vec![(waiter_id, waiter)],
                task: None,
                attempts: 0,
            },
        );
        self.deadlines.push(Reverse(DeadlineItem {
            deadline,
            generation,
            key: key.clone(),
        }));
        (PendingInsertOutcome::Inserted { generation }, evicted)
    }

    /// Store the attempt task's abort handle. Returns `false` when the entry already completed.
    pub fn attach_task(&mut self, key: &RequestKey, generation: u64, task: AbortHandle) -> bool {
        match self.entry_mut(key, generation) {
            Some(entry) => {
                entry.task = Some(task);
                true
            }
            None => false,
        }
    }

    pub fn record_attempt(&mut self, key: &RequestKey, generation: u64) {
        if let Some(entry) = self.entry_mut(key, generation) {
            entry.attempts = entry.attempts.saturating_add(1);
        }
    }

    /// Remove the entry and return its waiters.
    pub fn complete(&mut self, key: &RequestKey, generation: u64) -> Option<Vec<W>> {
        self.entry_mut(key, generation)?;
        self.entries
            .remove(key)
            .map(|entry| entry.waiters.into_iter().map(|(_, w)| w).collect())
    }

    pub fn detach(&mut self, key: &RequestKey, generation: u64, waiter_id: u64) -> Detached {
        let Some(entry) = self.entry_mut(key, generation) else {
            return Detached::NotFound;
        };
        let before = entry.waiters.len();
        entry.waiters.retain(|(id, _)| *id != waiter_id);
        if entry.waiters.len() == before {
            return Detached::NotFound;
        }
        if !entry.waiters.is_empty() {
            return Detached::Remaining(entry.waiters.len());
        }
        let task = self.entries.remove(key).and_then(|entry| entry.task);
        Detached::Last { task }
    }

    pub fn expire_due(&mut self, now: Instant) -> Vec<PendingExpired<W>> {
        let mut out = Vec::new();
        while self
            .deadlines
            .peek()
            .is_some_and(|Reverse(item)| item.deadline <= now)
        {
            let Some(Reverse(item)) = self.deadlines.pop() else {
                break;
            };
            // Stale heap item (entry removed or replaced).
            if self.entry_mut(&item.key, item.generation).is_none() {
                continue;
            }
            if let Some((key, entry)) = self.entries.remove_entry(&item.key) {
                out.push(Self::into_expired(key, entry));
            }
        }
        out
    }

    /// Remove every entry; used on client shutdown.
    pub fn drain(&mut self) -> Vec<PendingExpired<W>> {
        self.deadlines.clear();
        self.entries
            .drain()
            .map(|(key, entry)| Self::into_expired(key, entry))
            .collect()
    }

    fn entry_mut(&mut self, key: &RequestKey, generation: u64) -> Option<&mut PendingEntry<W>> {
        self.entries
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
    }

    fn into_expired(key: RequestKey, entry: PendingEntry<W>) -> PendingExpired<W> {
        PendingExpired {
            key,
            attempts: entry.attempts,
            waiters: entry.waiters.into_iter().map(|(_, w)| w).collect(),
            task: entry.task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn key(method: &str) -> RequestKey {
        RequestKey::new(method, &json!({}))
    }

    #[test]
    fn dedup_joins_waiters_under_one_entry() {
        let mut table = PendingTable::<u32>::new();
        let now = Instant::now();
        let d = now + Duration::from_secs(5);
        let m = key("m");

        let (first, evicted) = table.insert_or_join(&m, now, d, 1, 10);
        assert!(matches!(first, PendingInsertOutcome::Inserted { .. }));
        assert!(evicted.is_none());
        let (second, _) = table.insert_or_join(&m, now, d, 2, 11);
        assert_eq!(
            second,
            PendingInsertOutcome::Joined {
                generation: first.generation()
            }
        );

        assert_eq!(table.len(), 1);
        assert_eq!(table.complete(&m, first.generation()), Some(vec![10, 11]));
        assert!(table.is_empty());
    }

    #[test]
    fn different_params_never_share_an_entry() {
        let mut table = PendingTable::<u32>::new();
        let now = Instant::now();
        let d = now + Duration::from_secs(5);
        let a = RequestKey::new("consensus.tps", &json!({"window": 10}));
        let b = RequestKey::new("consensus.tps", &json!({"window": 11}));

        table.insert_or_join(&a, now, d, 1, 10);
        let (outcome, _) = table.insert_or_join(&b, now, d, 2, 20);
        assert!(matches!(outcome, PendingInsertOutcome::Inserted { .. }));
        assert_eq!(table.len(), 2);
        assert_eq!(table.waiter_count(&a), 1);
        assert_eq!(table.waiter_count(&b), 1);
    }

    #[test]
    fn expired_entry_is_replaced_and_returned() {
        let mut table = PendingTable::<u32>::new();
        let now = Instant::now();
        let m = key("m");
        let (old, _) = table.insert_or_join(&m, now, now + Duration::from_millis(5), 1, 10);
        table.record_attempt(&m, old.generation());

        let later = now + Duration::from_secs(1);
        let (new, evicted) = table.insert_or_join(&m, later, later + Duration::from_secs(5), 2, 20);
        assert!(matches!(new, PendingInsertOutcome::Inserted { .. }));
        assert_ne!(new.generation(), old.generation());
        let evicted = evicted.expect("old entry evicted");
        assert_eq!(evicted.waiters, vec![10]);
        assert_eq!(evicted.attempts, 1);
        assert_eq!(evicted.key.method(), "m");

        // Completion aimed at the old generation does not touch the new entry.
        assert!(table.complete(&m, old.generation()).is_none());
        assert_eq!(table.waiter_count(&m), 1);
    }

    #[test]
    fn last_detach_removes_entry() {
        let mut table = PendingTable::<u32>::new();
        let now = Instant::now();
        let d = now + Duration::from_secs(5);
        let m = key("m");
        let (outcome, _) = table.insert_or_join(&m, now, d, 1, 10);
        table.insert_or_join(&m, now, d, 2, 11);
        let generation = outcome.generation();

        assert!(matches!(table.detach(&m, generation, 1), Detached::Remaining(1)));
        assert!(matches!(table.detach(&m, generation, 1), Detached::NotFound));
        assert!(matches!(table.detach(&m, generation, 2), Detached::Last { task: None }));
        assert!(table.is_empty());
        assert!(!table.contains(&m));
    }

    #[test]
    fn expire_due_skips_stale_heap_items() {
        let mut table = PendingTable::<u32>::new();
        let now = Instant::now();
        let (a, b) = (key("a"), key("b"));
        let (first, _) = table.insert_or_join(&a, now, now + Duration::from_millis(1), 1, 1);
        table.insert_or_join(&b, now, now + Duration::from_secs(60), 2, 2);
        table.complete(&a, first.generation());

        assert!(table.expire_due(now + Duration::from_secs(1)).is_empty());
        assert!(table.contains(&b));

        let expired = table.expire_due(now + Duration::from_secs(61));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, b);
        assert!(table.is_empty());
    }
}
