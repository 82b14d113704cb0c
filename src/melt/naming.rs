//! Field and table name derivation.
//!
//! Names are a pure function of the structural path and the configuration;
//! the LRU cache only memoizes results and never changes them.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{MeltError, Result};

static INVALID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.\-]").unwrap());

/// Component used in place of the interior of a collapsed deep table path.
pub const NESTED_MARKER: &str = "nested";

/// Prefix for sanitized names that would otherwise start with a digit.
pub const DIGIT_PREFIX: &str = "col";

/// What to do when two distinct deep paths collapse to the same table name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Merge the rows into one table and log a warning.
    #[default]
    Merge,
    /// Fail the node that produced the second path.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Shorten interior path components of field names
    pub abbreviate: bool,
    /// Component length after abbreviation (0 disables truncation)
    pub max_component_length: usize,
    pub preserve_root: bool,
    pub preserve_leaf: bool,
    /// Substring substitutions applied before truncation
    pub abbreviations: BTreeMap<String, String>,
    /// Array paths with at least this many components are collapsed
    pub deeply_nested_threshold: usize,
    pub sanitize: bool,
    /// Entries kept in the name cache (0 disables caching)
    pub cache_size: usize,
    pub on_collision: CollisionPolicy,
}

impl Default for NamingConfig {
    fn default() -> Self {
        NamingConfig {
            abbreviate: true,
            max_component_length: 4,
            preserve_root: true,
            preserve_leaf: true,
            abbreviations: BTreeMap::new(),
            deeply_nested_threshold: 4,
            sanitize: true,
            cache_size: 1024,
            on_collision: CollisionPolicy::Merge,
        }
    }
}

/// Resolves structural paths to field and table names.
pub struct NameResolver {
    config: NamingConfig,
    separator: String,
    repeated_separator: Regex,
    cache: Mutex<Option<LruCache<CacheKey, String>>>,
}

/// Memo key: name kind plus the structured path it was derived from.
type CacheKey = (char, Vec<String>);

/// First path seen producing a collapsed table name.
#[derive(Debug)]
struct CollapsedName {
    first: Vec<String>,
    warned: bool,
}

/// Collapsed-name bookkeeping for one processing call.
///
/// Owned by the caller of the engine so that no collision state survives from
/// one `process`, `process_batch` or `stream` call to the next.
#[derive(Debug, Default)]
pub struct Collisions {
    seen: HashMap<String, CollapsedName>,
}

impl Collisions {
    pub fn new() -> Self {
        Collisions::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl NameResolver {
    pub fn new(config: NamingConfig, separator: impl Into<String>) -> Result<Self> {
        let separator = separator.into();
        if separator.is_empty() {
            return Err(MeltError::config("separator must not be empty"));
        }
        let pattern = format!("(?:{}){{2,}}", regex::escape(&separator));
        let repeated_separator = Regex::new(&pattern)
            .map_err(|e| MeltError::config(format!("invalid separator '{separator}': {e}")))?;
        let cache = NonZeroUsize::new(config.cache_size).map(LruCache::new);

        Ok(NameResolver {
            config,
            separator,
            repeated_separator,
            cache: Mutex::new(cache),
        })
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Drop all memoized names.
    pub fn clear(&self) {
        if let Some(cache) = self.cache.lock().as_mut() {
            cache.clear();
        }
    }

    /// Change the cache capacity; 0 disables caching.
    pub fn resize(&self, capacity: usize) {
        let mut cache = self.cache.lock();
        match (NonZeroUsize::new(capacity), cache.as_mut()) {
            (Some(cap), Some(existing)) => existing.resize(cap),
            (Some(cap), None) => *cache = Some(LruCache::new(cap)),
            (None, _) => *cache = None,
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().as_ref().map_or(0, LruCache::len)
    }

    /// Make a raw key safe for use as a column or table name component.
    pub fn sanitize(&self, key: &str) -> String {
        if !self.config.sanitize {
            return key.to_string();
        }
        let replaced = INVALID_CHARS.replace_all(key, NoExpand(&self.separator));
        let collapsed = self
            .repeated_separator
            .replace_all(&replaced, NoExpand(&self.separator));
        let mut name: &str = &collapsed;
        while let Some(rest) = name.strip_prefix(self.separator.as_str()) {
            name = rest;
        }
        while let Some(rest) = name.strip_suffix(self.separator.as_str()) {
            name = rest;
        }

        if name.is_empty() {
            return String::from("field");
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            return format!("{DIGIT_PREFIX}{}{name}", self.separator);
        }
        name.to_string()
    }

    /// Column name for a path relative to the row that owns it.
    pub fn field_name(&self, path: &[String]) -> String {
        self.memoized('f', path, || self.build_field_name(path))
    }

    /// Column name for a path with every component kept in full.
    pub fn full_field_name(&self, path: &[String]) -> String {
        self.memoized('u', path, || {
            let parts: Vec<String> = path.iter().map(|s| self.sanitize(s)).collect();
            parts.join(&self.separator)
        })
    }

    fn build_field_name(&self, path: &[String]) -> String {
        let last = path.len().saturating_sub(1);
        let parts: Vec<String> = path
            .iter()
            .enumerate()
            .map(|(i, segment)| {
                let name = self.sanitize(segment);
                let keep = !self.config.abbreviate
                    || (i == 0 && self.config.preserve_root)
                    || (i == last && self.config.preserve_leaf);
                if keep {
                    name
                } else {
                    self.abbreviate(&name)
                }
            })
            .collect();
        parts.join(&self.separator)
    }

    /// Apply the longest matching abbreviation, then truncate.
    pub fn abbreviate(&self, component: &str) -> String {
        let best = self
            .config
            .abbreviations
            .iter()
            .filter(|(from, _)| !from.is_empty() && component.contains(from.as_str()))
            .max_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| b.0.cmp(a.0)));

        let substituted = match best {
            Some((from, to)) => component.replacen(from.as_str(), to, 1),
            None => component.to_string(),
        };

        match self.config.max_component_length {
            0 => substituted,
            max => substituted.chars().take(max).collect(),
        }
    }

    /// Table name for an array path below `entity`.
    ///
    /// Paths shorter than the deep-nesting threshold are joined in full; longer
    /// ones collapse to `entity_first_nested_last`.
    pub fn table_name(&self, entity: &str, array_path: &[String]) -> String {
        let mut key = Vec::with_capacity(array_path.len() + 1);
        key.push(entity.to_string());
        key.extend(array_path.iter().cloned());
        self.memoized('t', &key, || self.build_table_name(entity, array_path))
    }

    fn build_table_name(&self, entity: &str, array_path: &[String]) -> String {
        let mut parts = vec![self.sanitize(entity)];
        if array_path.len() < self.config.deeply_nested_threshold {
            parts.extend(array_path.iter().map(|c| self.sanitize(c)));
        } else if let (Some(first), Some(last)) = (array_path.first(), array_path.last()) {
            parts.push(self.sanitize(first));
            parts.push(NESTED_MARKER.to_string());
            parts.push(self.sanitize(last));
        }
        parts.join(&self.separator)
    }

    pub fn is_collapsed(&self, array_path: &[String]) -> bool {
        array_path.len() >= self.config.deeply_nested_threshold
    }

    /// [`table_name`](Self::table_name) plus detection of distinct deep paths
    /// that collapse onto the same name within one call.
    pub fn checked_table_name(
        &self,
        entity: &str,
        array_path: &[String],
        collisions: &mut Collisions,
    ) -> Result<String> {
        let name = self.table_name(entity, array_path);
        if !self.is_collapsed(array_path) {
            return Ok(name);
        }

        let seen = match collisions.seen.entry(name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(CollapsedName {
                    first: array_path.to_vec(),
                    warned: false,
                });
                return Ok(name);
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };
        if seen.first.as_slice() == array_path {
            return Ok(name);
        }

        let first = seen.first.join(".");
        match self.config.on_collision {
            CollisionPolicy::Merge => {
                if !seen.warned {
                    tracing::warn!(
                        table = %name,
                        path = %array_path.join("."),
                        first = %first,
                        "distinct nested paths collapsed into one table"
                    );
                    seen.warned = true;
                }
                Ok(name)
            }
            CollisionPolicy::Error => {
                let reason = format!("table name '{name}' already produced by path '{first}'");
                Err(MeltError::processing(array_path, reason))
            }
        }
    }

    fn memoized(&self, kind: char, path: &[String], build: impl FnOnce() -> String) -> String {
        let key: CacheKey = (kind, path.to_vec());
        if let Some(cache) = self.cache.lock().as_mut() {
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }
        let name = build();
        if let Some(cache) = self.cache.lock().as_mut() {
            cache.put(key, name.clone());
        }
        name
    }
}
