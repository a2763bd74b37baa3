//! Content-addressed LLM response cache
//!
//! Entries are keyed by `(workflow, step, prompt hash, model, temperature)`. Expired
//! entries are evicted lazily when read; when the entry count exceeds the configured
//! capacity the least recently used entries are dropped until the cache is back at the
//! cap. Entries are written through to an [`ArtifactStore`] so a later process can warm
//! up from disk.

use crate::clock::{elapsed_ms, SharedClock};
use crate::config::{CacheConfig, HashFunction};
use crate::persist::{sanitize_segment, SharedStore};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Number of leading/trailing characters sampled by the simple prompt hash
const AFFIX_LEN: usize = 32;

/// Placeholder used in keys when model or temperature is unspecified
const UNSPECIFIED: &str = "default";

/// Prompt-hash position of the slot a step-wide override is registered under
const ANY_PROMPT: &str = "*";

/// Extra information stored with a cached response
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Latency of the original, uncached call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Installed by hand rather than by a real call
    #[serde(default, rename = "override")]
    pub is_override: bool,
}

/// One cached response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub workflow: String,
    pub step: String,
    pub prompt_hash: String,
    pub response: Value,
    pub created_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_used: DateTime<Utc>,
    /// Position in the recency order; larger is more recently used
    #[serde(default)]
    pub access_seq: u64,
    #[serde(default)]
    pub metadata: CacheMetadata,
}

/// Cache counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
    pub evictions: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Cache behaviour knobs
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl_ms: u64,
    pub max_cache_size: usize,
    pub hash_function: HashFunction,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl_ms: config.ttl_ms,
            max_cache_size: config.max_cache_size.max(1),
            hash_function: config.hash_function,
        }
    }
}

/// Options for [`ResponseCache::wrap_llm_call`]
#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    /// Ignore any cached value and overwrite it with a fresh call
    pub force_refresh: bool,
}

/// Value produced by [`ResponseCache::wrap_llm_call`]
#[derive(Debug, Clone)]
pub struct CachedResponse<T> {
    pub value: T,
    pub cache_hit: bool,
    pub key: String,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Step-wide slot (every coordinate but the prompt) -> key of its override
    step_overrides: HashMap<String, String>,
    /// Last value handed out by [`CacheState::touch`]
    access_seq: u64,
    hits: u64,
    misses: u64,
    saves: u64,
    evictions: u64,
}

impl CacheState {
    fn touch(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }
}

/// Hash a prompt with the configured strategy
pub fn prompt_hash(prompt: &str, function: HashFunction) -> String {
    match function {
        HashFunction::Full => format!("{:08x}", rolling_hash(prompt.chars())),
        HashFunction::Simple => {
            let chars: Vec<char> = prompt.chars().collect();
            let head = chars.iter().take(AFFIX_LEN);
            let tail = chars.iter().skip(chars.len().saturating_sub(AFFIX_LEN));
            let sample: String = head.chain(tail).collect();
            format!(
                "{}-{:08x}",
                chars.len(),
                rolling_hash(sample.chars())
            )
        }
    }
}

/// 32-bit multiplicative rolling hash (`h = h * 31 + c`)
fn rolling_hash(chars: impl Iterator<Item = char>) -> u32 {
    chars.fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}

/// Derive the cache key from its coordinates
pub fn cache_key(
    workflow: &str,
    step: &str,
    prompt_hash: &str,
    model: Option<&str>,
    temperature: Option<f64>,
) -> String {
    let temperature = temperature
        .map(|t| format!("{:.3}", t))
        .unwrap_or_else(|| UNSPECIFIED.to_string());
    let mut hasher = Sha256::new();
    for part in [
        workflow,
        step,
        prompt_hash,
        model.unwrap_or(UNSPECIFIED),
        temperature.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Lookup slot shared by every prompt of a step at one model and temperature
fn step_slot(workflow: &str, step: &str, model: Option<&str>, temperature: Option<f64>) -> String {
    cache_key(workflow, step, ANY_PROMPT, model, temperature)
}

/// Response cache
pub struct ResponseCache {
    settings: CacheSettings,
    enabled: AtomicBool,
    clock: SharedClock,
    store: SharedStore,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, clock: SharedClock, store: SharedStore) -> Self {
        Self {
            settings: CacheSettings::from(config),
            enabled: AtomicBool::new(config.enabled),
            clock,
            store,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hash a prompt with this cache's strategy
    pub fn hash_prompt(&self, prompt: &str) -> String {
        prompt_hash(prompt, self.settings.hash_function)
    }

    /// Key for a set of coordinates
    pub fn key_for(
        &self,
        workflow: &str,
        step: &str,
        prompt: &str,
        model: Option<&str>,
        temperature: Option<f64>,
    ) -> String {
        cache_key(workflow, step, &self.hash_prompt(prompt), model, temperature)
    }

    fn storage_key(entry: &CacheEntry) -> String {
        format!(
            "{}/{}/{}-{}",
            sanitize_segment(&entry.workflow),
            sanitize_segment(&entry.step),
            sanitize_segment(&entry.prompt_hash),
            &entry.key[..8.min(entry.key.len())]
        )
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        elapsed_ms(entry.created_at, now) > self.settings.ttl_ms
    }

    fn persist(&self, entry: &CacheEntry) {
        if entry.metadata.is_override {
            return;
        }
        match serde_json::to_value(entry) {
            Ok(value) => {
                if let Err(e) = self.store.save(&Self::storage_key(entry), &value) {
                    warn!(key = %entry.key, error = %e, "Failed to persist cache entry");
                }
            }
            Err(e) => warn!(key = %entry.key, error = %e, "Failed to serialize cache entry"),
        }
    }

    fn unpersist(&self, entry: &CacheEntry) {
        if let Err(e) = self.store.remove(&Self::storage_key(entry)) {
            warn!(key = %entry.key, error = %e, "Failed to remove persisted cache entry");
        }
    }

    /// Look up a response; expired entries are evicted and reported as a miss
    pub fn get(
        &self,
        workflow: &str,
        step: &str,
        prompt: &str,
        model: Option<&str>,
        temperature: Option<f64>,
    ) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }

        let key = self.key_for(workflow, step, prompt, model, temperature);
        self.lookup(&key, &step_slot(workflow, step, model, temperature))
    }

    fn lookup(&self, key: &str, slot: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut expired = None;
        let found = {
            let mut state = self.lock();
            let key = if state.entries.contains_key(key) {
                Some(key.to_string())
            } else {
                state.step_overrides.get(slot).cloned()
            };

            match key.and_then(|k| state.entries.get(&k).cloned()) {
                Some(entry) if self.is_expired(&entry, now) => {
                    state.entries.remove(&entry.key);
                    state.misses += 1;
                    expired = Some(entry);
                    None
                }
                Some(entry) => {
                    state.hits += 1;
                    let seq = state.touch();
                    if let Some(stored) = state.entries.get_mut(&entry.key) {
                        stored.hit_count += 1;
                        stored.last_used = now;
                        stored.access_seq = seq;
                    }
                    Some(entry.response)
                }
                None => {
                    state.misses += 1;
                    None
                }
            }
        };

        if let Some(entry) = expired {
            debug!(key = %entry.key, "Cache entry expired");
            self.unpersist(&entry);
        }
        if found.is_some() {
            debug!(key, "Cache hit");
        }
        found
    }

    /// Store a response, overwriting any entry with the same key
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &self,
        workflow: &str,
        step: &str,
        prompt: &str,
        response: Value,
        model: Option<&str>,
        temperature: Option<f64>,
        metadata: Option<CacheMetadata>,
    ) -> String {
        let prompt_hash = self.hash_prompt(prompt);
        let key = cache_key(workflow, step, &prompt_hash, model, temperature);
        let mut metadata = metadata.unwrap_or_default();
        if metadata.model.is_none() {
            metadata.model = model.map(str::to_string);
        }
        if metadata.temperature.is_none() {
            metadata.temperature = temperature;
        }
        self.insert(CacheEntry {
            key: key.clone(),
            workflow: workflow.to_string(),
            step: step.to_string(),
            prompt_hash,
            response,
            created_at: self.clock.now(),
            hit_count: 0,
            last_used: self.clock.now(),
            access_seq: 0,
            metadata,
        });
        key
    }

    fn insert(&self, mut entry: CacheEntry) {
        {
            let mut state = self.lock();
            state.saves += 1;
            entry.access_seq = state.touch();
            state.entries.insert(entry.key.clone(), entry.clone());
        }
        self.persist(&entry);
        self.evict_if_needed();
    }

    /// Force-install a response for exact coordinates, flagged as an override
    pub fn set_override(
        &self,
        workflow: &str,
        step: &str,
        prompt: &str,
        response: Value,
        model: Option<&str>,
        temperature: Option<f64>,
    ) -> String {
        let metadata = CacheMetadata {
            is_override: true,
            ..Default::default()
        };
        info!(workflow, step, "Installing cache override");
        self.set(workflow, step, prompt, response, model, temperature, Some(metadata))
    }

    /// Install an override answering every prompt of one step
    ///
    /// The entry is stored under `synthetic_prompt`; lookups with the same workflow, step,
    /// model and temperature that miss their exact key fall back to it.
    pub fn set_step_override(
        &self,
        workflow: &str,
        step: &str,
        synthetic_prompt: &str,
        response: Value,
        model: Option<&str>,
        temperature: Option<f64>,
    ) -> String {
        let key = self.set_override(workflow, step, synthetic_prompt, response, model, temperature);
        self.lock()
            .step_overrides
            .insert(step_slot(workflow, step, model, temperature), key.clone());
        key
    }

    /// Remove every step-wide override registration
    pub fn clear_step_overrides(&self) {
        self.lock().step_overrides.clear();
    }

    /// Drop least-recently-used entries until the cache is at its cap
    fn evict_if_needed(&self) {
        let evicted: Vec<CacheEntry> = {
            let mut state = self.lock();
            let excess = state
                .entries
                .len()
                .saturating_sub(self.settings.max_cache_size);
            if excess == 0 {
                return;
            }
            let mut by_recency: Vec<(u64, String)> = state
                .entries
                .values()
                .map(|e| (e.access_seq, e.key.clone()))
                .collect();
            by_recency.sort();

            let mut evicted = Vec::with_capacity(excess);
            for (_, key) in by_recency.into_iter().take(excess) {
                if let Some(entry) = state.entries.remove(&key) {
                    evicted.push(entry);
                }
            }
            state.evictions += evicted.len() as u64;
            let live: std::collections::HashSet<String> =
                state.entries.keys().cloned().collect();
            state.step_overrides.retain(|_, k| live.contains(k));
            evicted
        };

        for entry in &evicted {
            debug!(key = %entry.key, "Evicted least recently used cache entry");
            self.unpersist(entry);
        }
    }

    /// Get-or-compute: serve a cached response or call `f` and cache its result
    pub async fn wrap_llm_call<T, F, Fut>(
        &self,
        workflow: &str,
        step: &str,
        prompt: &str,
        f: F,
        options: &WrapOptions,
    ) -> anyhow::Result<CachedResponse<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let model = options.model.as_deref();
        let key = self.key_for(workflow, step, prompt, model, options.temperature);

        if self.is_enabled() && !options.force_refresh {
            let slot = step_slot(workflow, step, model, options.temperature);
            if let Some(cached) = self.lookup(&key, &slot) {
                match serde_json::from_value::<T>(cached) {
                    Ok(value) => {
                        return Ok(CachedResponse {
                            value,
                            cache_hit: true,
                            key,
                        })
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Cached response has unexpected shape, refreshing")
                    }
                }
            }
        }

        let started = Instant::now();
        let value = f().await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if self.is_enabled() {
            let response = serde_json::to_value(&value)?;
            let metadata = CacheMetadata {
                tokens: crate::models::TokenUsage::from_response(&response)
                    .map(|u| u.total_tokens),
                latency_ms: Some(latency_ms),
                ..Default::default()
            };
            self.set(
                workflow,
                step,
                prompt,
                response,
                model,
                options.temperature,
                Some(metadata),
            );
        }

        Ok(CachedResponse {
            value,
            cache_hit: false,
            key,
        })
    }

    /// Remove entries of a workflow, optionally restricted to one step
    pub fn invalidate(&self, workflow: &str, step: Option<&str>) -> usize {
        let removed: Vec<CacheEntry> = {
            let mut state = self.lock();
            let keys: Vec<String> = state
                .entries
                .values()
                .filter(|e| e.workflow == workflow && step.map_or(true, |s| e.step == s))
                .map(|e| e.key.clone())
                .collect();
            keys.iter()
                .filter_map(|k| state.entries.remove(k))
                .collect()
        };
        for entry in &removed {
            self.unpersist(entry);
        }
        removed.len()
    }

    /// Evict every expired entry now; returns how many were removed
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let removed: Vec<CacheEntry> = {
            let mut state = self.lock();
            let keys: Vec<String> = state
                .entries
                .values()
                .filter(|e| self.is_expired(e, now))
                .map(|e| e.key.clone())
                .collect();
            keys.iter()
                .filter_map(|k| state.entries.remove(k))
                .collect()
        };
        for entry in &removed {
            self.unpersist(entry);
        }
        removed.len()
    }

    /// Drop every entry, in memory and in the backing store, and reset counters
    pub fn clear(&self) {
        *self.lock() = CacheState::default();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear persisted cache");
        }
    }

    /// Number of entries held in memory
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry exists for a key, expired or not
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            saves: state.saves,
            evictions: state.evictions,
            entries: state.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    /// Plain key -> entry mapping for sharing between sessions
    pub fn export(&self) -> BTreeMap<String, CacheEntry> {
        self.lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Merge exported entries, overwriting same keys; returns how many were imported
    pub fn import(&self, entries: BTreeMap<String, CacheEntry>) -> usize {
        self.merge(entries, true)
    }

    fn merge(&self, entries: BTreeMap<String, CacheEntry>, persist: bool) -> usize {
        let count = entries.len();
        let mut incoming: Vec<(String, CacheEntry)> = entries.into_iter().collect();
        incoming.sort_by_key(|(_, e)| (e.last_used, e.access_seq));
        let mut merged = Vec::with_capacity(count);
        {
            let mut state = self.lock();
            for (key, mut entry) in incoming {
                entry.key = key.clone();
                entry.access_seq = state.touch();
                if persist {
                    merged.push(entry.clone());
                }
                state.entries.insert(key, entry);
            }
        }
        for entry in &merged {
            self.persist(entry);
        }
        self.evict_if_needed();
        count
    }

    /// Delete expired and unreadable entries from the backing store
    pub fn prune_store(&self) -> usize {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list persisted cache entries");
                return 0;
            }
        };

        let now = self.clock.now();
        let mut removed = 0;
        for storage_key in keys {
            let stale = match self.store.load(&storage_key) {
                Ok(Some(value)) => serde_json::from_value::<CacheEntry>(value)
                    .map(|entry| self.is_expired(&entry, now))
                    .unwrap_or(true),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale {
                match self.store.remove(&storage_key) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(key = %storage_key, error = %e, "Failed to remove cache file"),
                }
            }
        }
        removed
    }

    /// Load every unexpired entry from the backing store
    pub fn load_from_store(&self) -> usize {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list persisted cache entries");
                return 0;
            }
        };

        let now = self.clock.now();
        let mut loaded = BTreeMap::new();
        for storage_key in keys {
            let value = match self.store.load(&storage_key) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) if !self.is_expired(&entry, now) => {
                    loaded.insert(entry.key.clone(), entry);
                }
                Ok(_) => {}
                Err(e) => warn!(key = %storage_key, error = %e, "Skipping malformed cache file"),
            }
        }

        let count = self.merge(loaded, false);
        info!(entries = count, "Loaded persisted cache entries");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::persist::{ArtifactStore, FileStore, MemoryStore, NullStore};
    use serde_json::json;
    use std::sync::Arc;

    fn cache_with(ttl_ms: u64, max: usize) -> (ResponseCache, MockClock) {
        let clock = MockClock::at_epoch();
        let config = CacheConfig {
            ttl_ms,
            max_cache_size: max,
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(&config, Arc::new(clock.clone()), Arc::new(NullStore));
        (cache, clock)
    }

    #[test]
    fn test_set_then_get_exact_coordinates() {
        let (cache, _clock) = cache_with(60_000, 100);
        cache.set("wf", "s1", "p1", json!({"a": 1}), None, None, None);

        assert_eq!(cache.get("wf", "s1", "p1", None, None), Some(json!({"a": 1})));
        assert_eq!(cache.get("wf", "s1", "p2", None, None), None);
        assert_eq!(cache.get("wf", "s2", "p1", None, None), None);
        assert_eq!(cache.get("other", "s1", "p1", None, None), None);
        assert_eq!(cache.get("wf", "s1", "p1", Some("gpt-4o"), None), None);
        assert_eq!(cache.get("wf", "s1", "p1", None, Some(0.2)), None);
    }

    #[test]
    fn test_ttl_expiry_on_read() {
        let (cache, clock) = cache_with(1000, 100);
        cache.set("wf", "s1", "p1", json!("r"), None, None, None);

        clock.advance_ms(1500);
        assert!(cache.len() == 1);
        assert_eq!(cache.get("wf", "s1", "p1", None, None), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_entry_at_exact_ttl_is_still_valid() {
        let (cache, clock) = cache_with(1000, 100);
        cache.set("wf", "s1", "p1", json!("r"), None, None, None);
        clock.advance_ms(1000);
        assert_eq!(cache.get("wf", "s1", "p1", None, None), Some(json!("r")));
    }

    #[test]
    fn test_lru_eviction_keeps_recently_used() {
        let (cache, clock) = cache_with(60_000, 2);
        cache.set("wf", "A", "p", json!("a"), None, None, None);
        clock.advance_ms(1);
        cache.set("wf", "B", "p", json!("b"), None, None, None);
        clock.advance_ms(1);
        assert!(cache.get("wf", "A", "p", None, None).is_some());
        clock.advance_ms(1);
        cache.set("wf", "C", "p", json!("c"), None, None, None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("wf", "A", "p", None, None).is_some());
        assert!(cache.get("wf", "B", "p", None, None).is_none());
        assert!(cache.get("wf", "C", "p", None, None).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_set_overwrites_and_hit_counter() {
        let (cache, _clock) = cache_with(60_000, 10);
        cache.set("wf", "s", "p", json!(1), None, None, None);
        let key = cache.set("wf", "s", "p", json!(2), None, None, None);
        assert_eq!(cache.len(), 1);

        cache.get("wf", "s", "p", None, None);
        cache.get("wf", "s", "p", None, None);
        assert_eq!(cache.export()[&key].hit_count, 2);
        assert_eq!(cache.export()[&key].response, json!(2));
    }

    #[test]
    fn test_hash_functions_are_deterministic_and_distinct() {
        let long_a = format!("{}middle-one{}", "x".repeat(40), "y".repeat(40));
        let long_b = format!("{}middle-two{}", "x".repeat(40), "y".repeat(40));

        assert_eq!(
            prompt_hash(&long_a, HashFunction::Full),
            prompt_hash(&long_a, HashFunction::Full)
        );
        assert_ne!(
            prompt_hash(&long_a, HashFunction::Full),
            prompt_hash(&long_b, HashFunction::Full)
        );
        // Same length and affixes collide under the cheap heuristic
        assert_eq!(
            prompt_hash(&long_a, HashFunction::Simple),
            prompt_hash(&long_b, HashFunction::Simple)
        );
        assert!(prompt_hash("abc", HashFunction::Simple).starts_with("3-"));
    }

    #[test]
    fn test_cache_key_depends_on_every_coordinate() {
        let base = cache_key("wf", "s", "h", Some("m"), Some(0.5));
        assert_eq!(base, cache_key("wf", "s", "h", Some("m"), Some(0.5)));
        assert_ne!(base, cache_key("wf2", "s", "h", Some("m"), Some(0.5)));
        assert_ne!(base, cache_key("wf", "s2", "h", Some("m"), Some(0.5)));
        assert_ne!(base, cache_key("wf", "s", "h2", Some("m"), Some(0.5)));
        assert_ne!(base, cache_key("wf", "s", "h", Some("m2"), Some(0.5)));
        assert_ne!(base, cache_key("wf", "s", "h", Some("m"), Some(0.7)));
        assert_eq!(base.len(), 32);
    }

    #[tokio::test]
    async fn test_wrap_llm_call_get_or_compute() {
        let (cache, _clock) = cache_with(60_000, 10);
        let calls = std::sync::atomic::AtomicUsize::new(0);

        let options = WrapOptions::default();
        for _ in 0..2 {
            let result = cache
                .wrap_llm_call(
                    "wf",
                    "summarize",
                    "prompt",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>("summary".to_string())
                    },
                    &options,
                )
                .await
                .unwrap();
            assert_eq!(result.value, "summary");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);

        let forced = WrapOptions {
            force_refresh: true,
            ..Default::default()
        };
        let result = cache
            .wrap_llm_call(
                "wf",
                "summarize",
                "prompt",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>("fresh".to_string())
                },
                &forced,
            )
            .await
            .unwrap();
        assert!(!result.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.get("wf", "summarize", "prompt", None, None),
            Some(json!("fresh"))
        );
    }

    #[tokio::test]
    async fn test_wrap_llm_call_error_is_not_cached() {
        let (cache, _clock) = cache_with(60_000, 10);
        let result: anyhow::Result<CachedResponse<String>> = cache
            .wrap_llm_call(
                "wf",
                "s",
                "p",
                || async { anyhow::bail!("provider down") },
                &WrapOptions::default(),
            )
            .await;
        assert_eq!(result.unwrap_err().to_string(), "provider down");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_override_flag_and_step_override_fallback() {
        let (cache, _clock) = cache_with(60_000, 10);
        let key = cache.set_override("wf", "s", "p", json!("forced"), None, None);
        assert!(cache.export()[&key].metadata.is_override);

        cache.set_step_override("wf", "classify", "scenario:smoke", json!("label"), Some("m"), None);
        assert_eq!(
            cache.get("wf", "classify", "any prompt at all", Some("m"), None),
            Some(json!("label"))
        );
        assert_eq!(cache.get("wf", "classify", "any prompt at all", Some("gpt-4o"), None), None);
        assert_eq!(cache.get("wf", "classify", "any prompt at all", Some("m"), Some(0.9)), None);
        assert_eq!(cache.get("other", "classify", "any prompt at all", Some("m"), None), None);

        cache.clear_step_overrides();
        assert_eq!(cache.get("wf", "classify", "any prompt at all", Some("m"), None), None);
    }

    #[test]
    fn test_overrides_are_not_persisted() {
        let store = MemoryStore::new();
        let cache = ResponseCache::new(
            &CacheConfig::default(),
            Arc::new(MockClock::at_epoch()),
            Arc::new(store.clone()),
        );
        cache.set_override("wf", "s", "p", json!("forced"), None, None);
        cache.set_step_override("wf", "s", "scenario:x", json!("any"), None, None);
        cache.set("wf", "s", "real", json!("kept"), None, None, None);

        let keys = store.keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_lru_order_at_equal_timestamps() {
        let (cache, _clock) = cache_with(60_000, 1);
        for i in 0..20 {
            cache.set("wf", "s", &format!("old {}", i), json!("old"), None, None, None);
            cache.set("wf", "s", &format!("new {}", i), json!("new"), None, None, None);
            assert_eq!(cache.len(), 1);
            assert_eq!(
                cache.get("wf", "s", &format!("new {}", i), None, None),
                Some(json!("new"))
            );
        }

        let (cache, _clock) = cache_with(60_000, 2);
        cache.set("wf", "s", "a", json!(1), None, None, None);
        cache.set("wf", "s", "b", json!(2), None, None, None);
        assert!(cache.get("wf", "s", "a", None, None).is_some());
        cache.set("wf", "s", "c", json!(3), None, None, None);
        assert!(cache.get("wf", "s", "a", None, None).is_some());
        assert!(cache.get("wf", "s", "b", None, None).is_none());
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let (cache, _clock) = cache_with(60_000, 10);
        cache.set("wf", "s", "p", json!(1), None, None, None);
        cache.set_enabled(false);
        assert_eq!(cache.get("wf", "s", "p", None, None), None);
        cache.set_enabled(true);
        assert_eq!(cache.get("wf", "s", "p", None, None), Some(json!(1)));
    }

    #[test]
    fn test_stats_hit_rate() {
        let (cache, _clock) = cache_with(60_000, 10);
        cache.set("wf", "s", "p", json!(1), None, None, None);
        cache.get("wf", "s", "p", None, None);
        cache.get("wf", "s", "missing", None, None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.saves, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_invalidate_and_prune() {
        let (cache, clock) = cache_with(1000, 10);
        cache.set("wf", "a", "p", json!(1), None, None, None);
        cache.set("wf", "b", "p", json!(2), None, None, None);
        cache.set("other", "a", "p", json!(3), None, None, None);

        assert_eq!(cache.invalidate("wf", Some("a")), 1);
        assert_eq!(cache.len(), 2);

        clock.advance_ms(2000);
        cache.set("fresh", "a", "p", json!(4), None, None, None);
        assert_eq!(cache.prune_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let (source, _clock) = cache_with(60_000, 10);
        source.set("wf", "s", "p", json!({"x": 1}), Some("m"), Some(0.1), None);

        let (target, _clock) = cache_with(60_000, 10);
        assert_eq!(target.import(source.export()), 1);
        assert_eq!(
            target.get("wf", "s", "p", Some("m"), Some(0.1)),
            Some(json!({"x": 1}))
        );
    }

    #[test]
    fn test_persisted_entries_warm_a_new_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = MockClock::at_epoch();
        let config = CacheConfig::default();

        let first = ResponseCache::new(
            &config,
            Arc::new(clock.clone()),
            Arc::new(FileStore::new(dir.path())),
        );
        first.set("wf", "s", "p", json!("persisted"), None, None, None);

        let second = ResponseCache::new(
            &config,
            Arc::new(clock.clone()),
            Arc::new(FileStore::new(dir.path())),
        );
        assert_eq!(second.load_from_store(), 1);
        assert_eq!(second.get("wf", "s", "p", None, None), Some(json!("persisted")));
    }

    #[test]
    fn test_prune_store_drops_expired_files() {
        let store = MemoryStore::new();
        let clock = MockClock::at_epoch();
        let config = CacheConfig {
            ttl_ms: 1000,
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(&config, Arc::new(clock.clone()), Arc::new(store.clone()));
        cache.set("wf", "old", "p", json!(1), None, None, None);
        clock.advance_ms(1500);
        cache.set("wf", "new", "p", json!(2), None, None, None);
        store.save("wf/junk/broken.json", &json!("not an entry")).unwrap();

        assert_eq!(cache.prune_store(), 2);
        let keys = store.keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("wf/new/"));
    }

    #[test]
    fn test_import_writes_through() {
        let (source, _clock) = cache_with(60_000, 10);
        source.set("wf", "s", "p", json!("imported"), None, None, None);

        let store = MemoryStore::new();
        let target = ResponseCache::new(
            &CacheConfig::default(),
            Arc::new(MockClock::at_epoch()),
            Arc::new(store.clone()),
        );
        target.import(source.export());
        assert_eq!(store.keys().unwrap().len(), 1);
    }

    #[test]
    fn test_eviction_removes_persisted_copy() {
        let store = MemoryStore::new();
        let clock = MockClock::at_epoch();
        let config = CacheConfig {
            max_cache_size: 1,
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(&config, Arc::new(clock.clone()), Arc::new(store.clone()));
        cache.set("wf", "a", "p", json!(1), None, None, None);
        clock.advance_ms(1);
        cache.set("wf", "b", "p", json!(2), None, None, None);

        let keys = store.keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("wf/b/"));
    }
}
