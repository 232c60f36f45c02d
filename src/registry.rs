//! Bounded map from generation id to generation record
//!
//! Records are created by the local start call or by an inbound INIT
//! packet, so an attacker can mint them; retention is therefore bounded.
//! At capacity the oldest completed generation is evicted first, and
//! when nothing has completed yet the oldest record outright.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::crypto::GenerationId;
use crate::generation::{Generation, State};

/// Generations kept before eviction kicks in.
pub const DEFAULT_RETENTION: usize = 1024;

pub struct Registry {
    generations: HashMap<GenerationId, Generation>,
    /// Creation order, oldest first.
    order: VecDeque<GenerationId>,
    capacity: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RETENTION)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            generations: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &GenerationId) -> bool {
        self.generations.contains_key(id)
    }

    pub fn get(&self, id: &GenerationId) -> Option<&Generation> {
        self.generations.get(id)
    }

    pub fn get_mut(&mut self, id: &GenerationId) -> Option<&mut Generation> {
        self.generations.get_mut(id)
    }

    /// Derived state lookup; unseen ids report [`State::Unknown`].
    pub fn state(&self, id: &GenerationId) -> State {
        self.generations
            .get(id)
            .map_or(State::Unknown, Generation::state)
    }

    pub fn insert(&mut self, id: GenerationId, generation: Generation) {
        if !self.generations.contains_key(&id) && self.generations.len() >= self.capacity {
            self.evict_one();
        }
        if self.generations.insert(id, generation).is_none() {
            self.order.push_back(id);
        }
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    fn evict_one(&mut self) {
        let victim = self
            .order
            .iter()
            .position(|id| self.state(id) == State::Done)
            .or(if self.order.is_empty() { None } else { Some(0) });
        if let Some(pos) = victim {
            if let Some(id) = self.order.remove(pos) {
                self.generations.remove(&id);
                debug!("evicted generation {}", hex::encode(id));
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
