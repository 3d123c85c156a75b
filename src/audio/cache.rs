// src/audio/cache.rs
// Unbounded build-once caches for decoded clips and synthesized click tracks

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use super::click_track::{ClickKind, ClickSample, ClickTrackBuffer};
use super::tempo::TempoConfig;

type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

/// Map of immutable values, each built at most once per key.
///
/// The outer lock is only held long enough to find or create the key's slot;
/// the build itself runs under the slot's own lock, so concurrent requests
/// for one key wait for the first build while other keys proceed.
#[derive(Debug)]
pub struct BuildCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V> BuildCache<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_try_insert_with<E, F>(&self, key: &K, build: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut value = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = value.as_ref() {
            return Ok(Arc::clone(existing));
        }

        // A failed build leaves the slot empty so the next request retries.
        let built = Arc::new(build()?);
        *value = Some(Arc::clone(&built));
        Ok(built)
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(key).cloned()?
        };
        let value = slot.lock().unwrap_or_else(PoisonError::into_inner);
        value.clone()
    }

    /// Number of keys with a finished value.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot<V>> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|slot| {
                slot.try_lock()
                    .map(|value| value.is_some())
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V> Default for BuildCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache key for a synthesized track: the tempo plus the rate it was rendered at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub config: TempoConfig,
    pub sample_rate: u32,
}

pub type ClipCache = BuildCache<ClickKind, ClickSample>;
/// Clips converted to an output rate, keyed by kind and rate.
pub type ConvertedClipCache = BuildCache<(ClickKind, u32), ClickSample>;
pub type TrackCache = BuildCache<TrackKey, ClickTrackBuffer>;
