//! In-process implementation of the store capability set.
//!
//! All state sits behind a single mutex, which makes every batch trivially
//! atomic. Used by tests and by single-process deployments that do not need
//! durability.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;

use super::{End, Guard, Op, Store, StoreFuture};

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, Bytes>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
}

impl State {
    fn check(&self, guard: &Guard) -> bool {
        match guard {
            Guard::HashFieldEquals { key, field, value } => {
                let current = self.hashes.get(key).and_then(|hash| hash.get(field));
                current == value.as_ref()
            }
        }
    }

    fn apply(&mut self, op: Op) -> i64 {
        match op {
            Op::ListPushLeft { key, value } => {
                let list = self.lists.entry(key).or_default();
                list.push_front(value);
                list.len() as i64
            }
            Op::ListRemove { key, value, count } => self.list_remove(&key, &value, count),
            Op::ListMoveValue { src, dst, value } => {
                if self.list_remove(&src, &value, 1) == 1 {
                    self.lists.entry(dst).or_default().push_front(value);
                    1
                } else {
                    0
                }
            }
            Op::HashSet { key, field, value } => {
                let hash = self.hashes.entry(key).or_default();
                match hash.insert(field, value) {
                    Some(_) => 0,
                    None => 1,
                }
            }
            Op::HashDeleteField { key, field } => {
                let Some(hash) = self.hashes.get_mut(&key) else {
                    return 0;
                };
                let removed = hash.remove(&field).is_some();
                if hash.is_empty() {
                    self.hashes.remove(&key);
                }
                removed as i64
            }
            Op::HashDelete { key } => self.hashes.remove(&key).is_some() as i64,
            Op::SortedSetAdd { key, score, member } => {
                match self.sorted_sets.entry(key).or_default().insert(member, score) {
                    Some(_) => 0,
                    None => 1,
                }
            }
            Op::SortedSetRemove { key, member } => {
                let Some(set) = self.sorted_sets.get_mut(&key) else {
                    return 0;
                };
                let removed = set.remove(&member).is_some();
                if set.is_empty() {
                    self.sorted_sets.remove(&key);
                }
                removed as i64
            }
        }
    }

    fn list_remove(&mut self, key: &str, value: &str, count: i64) -> i64 {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };

        let mut removed = 0usize;
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }

        if list.is_empty() {
            self.lists.remove(key);
        }
        removed as i64
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Ops never panic halfway, so a poisoned lock still holds consistent state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn atomic_batch<'a>(&'a self, ops: Vec<Op>) -> StoreFuture<'a, Vec<i64>> {
        let mut state = self.state();
        let replies = ops.into_iter().map(|op| state.apply(op)).collect();
        Box::pin(std::future::ready(Ok(replies)))
    }

    fn atomic_batch_if<'a>(
        &'a self,
        guard: Guard,
        ops: Vec<Op>,
    ) -> StoreFuture<'a, Option<Vec<i64>>> {
        let mut state = self.state();
        let replies = if state.check(&guard) {
            Some(ops.into_iter().map(|op| state.apply(op)).collect())
        } else {
            None
        };
        Box::pin(std::future::ready(Ok(replies)))
    }

    fn list_move<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        from: End,
        to: End,
    ) -> StoreFuture<'a, Option<String>> {
        let mut state = self.state();

        let value = state.lists.get_mut(src).and_then(|list| match from {
            End::Left => list.pop_front(),
            End::Right => list.pop_back(),
        });
        if state.lists.get(src).is_some_and(|list| list.is_empty()) {
            state.lists.remove(src);
        }

        if let Some(value) = &value {
            let list = state.lists.entry(dst.to_owned()).or_default();
            match to {
                End::Left => list.push_front(value.clone()),
                End::Right => list.push_back(value.clone()),
            }
        }

        Box::pin(std::future::ready(Ok(value)))
    }

    fn list_range<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        let values = self
            .state()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default();
        Box::pin(std::future::ready(Ok(values)))
    }

    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        let len = self.state().lists.get(key).map_or(0, |list| list.len() as u64);
        Box::pin(std::future::ready(Ok(len)))
    }

    fn hash_get<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        let value = self
            .state()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned();
        Box::pin(std::future::ready(Ok(value)))
    }

    fn hash_get_all<'a>(&'a self, key: &'a str) -> StoreFuture<'a, HashMap<String, Bytes>> {
        let fields = self.state().hashes.get(key).cloned().unwrap_or_default();
        Box::pin(std::future::ready(Ok(fields)))
    }

    fn sorted_set_range_by_score<'a>(
        &'a self,
        key: &'a str,
        max: f64,
    ) -> StoreFuture<'a, Vec<String>> {
        let mut members: Vec<(f64, String)> = self
            .state()
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= max)
                    .map(|(member, score)| (*score, member.clone()))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        Box::pin(std::future::ready(Ok(members
            .into_iter()
            .map(|(_, member)| member)
            .collect())))
    }

    fn close<'a>(&'a self) -> StoreFuture<'a, ()> {
        Box::pin(std::future::ready(Ok(())))
    }
}
