use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct CachedItem<S> {
    tokens: Vec<u32>,
    state: S,
    output: Vec<f32>,
}

/// Model states left behind by the last few scored sequences, with the scores each produced.
///
/// Holds at most `capacity` entries; the oldest one is evicted first.
#[derive(Debug, Clone)]
pub struct PrefixCache<S> {
    items: VecDeque<CachedItem<S>>,
    capacity: usize,
}

impl<S> PrefixCache<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Scores cached for exactly `tokens`.
    pub fn output(&self, tokens: &[u32]) -> Option<&[f32]> {
        self.items
            .iter()
            .find(|item| item.tokens == tokens)
            .map(|item| item.output.as_slice())
    }

    /// State of the longest cached sequence that `tokens` starts with, and that sequence's length.
    pub fn longest_prefix(&self, tokens: &[u32]) -> Option<(&S, usize)> {
        self.items
            .iter()
            .filter(|item| tokens.starts_with(&item.tokens))
            .max_by_key(|item| item.tokens.len())
            .map(|item| (&item.state, item.tokens.len()))
    }

    pub fn insert(&mut self, tokens: Vec<u32>, state: S, output: Vec<f32>) {
        self.items.retain(|item| item.tokens != tokens);
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(CachedItem {
            tokens,
            state,
            output,
        });
    }
}
