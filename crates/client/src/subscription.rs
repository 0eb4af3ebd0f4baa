use std::collections::BTreeMap;

use crate::frame::Arg;

/// Desired subscriptions, keyed by [`Arg::key`].
///
/// This is what gets replayed after every reconnect. Only explicit
/// subscribe/unsubscribe calls mutate it; the read path never does.
#[derive(Debug, Clone, Default)]
pub struct DesiredSet {
    topics: BTreeMap<String, Arg>,
}

impl DesiredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert args, returning the ones that were not already present.
    pub fn insert_all(&mut self, args: &[Arg]) -> Vec<Arg> {
        args.iter()
            .filter(|arg| self.topics.insert(arg.key(), (*arg).clone()).is_none())
            .cloned()
            .collect()
    }

    /// Remove args, returning the ones that were present.
    pub fn remove_all(&mut self, args: &[Arg]) -> Vec<Arg> {
        args.iter()
            .filter_map(|arg| self.topics.remove(&arg.key()))
            .collect()
    }

    pub fn contains(&self, arg: &Arg) -> bool {
        self.topics.contains_key(&arg.key())
    }

    pub fn snapshot(&self) -> Vec<Arg> {
        self.topics.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
