//! Content-addressed cache for remote file reads.
//!
//! Fronting the forge's `get_file` with this cache turns the common case —
//! the same template file compared against hundreds of targets — into a
//! single stored copy. Storage is addressed by SHA-256 of the content, with
//! a key table mapping `(repo, branch, path)` to a content id, so N keys
//! holding identical bytes cost one entry plus N table slots.
//!
//! Bookkeeping:
//!
//! - content entries are refcounted; an entry is freed when its last key is
//!   unbound (no scan over the key table on removal)
//! - recency is an arena-backed doubly-linked list (index links plus a free
//!   list), giving O(1) touch/evict without self-referential ownership
//! - a sweeper thread ticks at `ttl/2` and drops expired entries; a `get`
//!   that lands on an expired entry evicts it inline rather than serving
//!   stale bytes
//!
//! One mutex guards the structural state; hit/miss/eviction counters are
//! atomics so `stats()` never contends with readers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, select, tick};
use sha2::{Digest, Sha256};

use crate::cancel::CancelToken;

type ContentId = [u8; 32];

const NIL: usize = usize::MAX;

/// Cache lookup key. Paths are stored as given; the forge layer normalises
/// leading slashes before reaching here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repo: String,
    pub branch: String,
    pub path: String,
}

impl CacheKey {
    pub fn new(repo: &str, branch: &str, path: &str) -> Self {
        Self {
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum CacheError {
    /// A single value larger than the whole budget can never be admitted.
    ContentTooLarge { size: usize, max: usize },
    Cancelled,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::ContentTooLarge { size, max } => {
                write!(f, "content size {size} exceeds maximum cache size {max}")
            }
            CacheError::Cancelled => write!(f, "cache operation cancelled"),
        }
    }
}

impl std::error::Error for CacheError {}

struct ContentEntry {
    content: Arc<Vec<u8>>,
    refs: usize,
    created_at: Instant,
    accessed_at: Instant,
    expires_at: Instant,
}

struct KeyEntry {
    content: ContentId,
    node: usize,
}

struct LruNode {
    key: CacheKey,
    prev: usize,
    next: usize,
}

/// Most-recently-used at `head`, eviction candidates at `tail`.
struct LruList {
    nodes: Vec<LruNode>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruList {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn push_front(&mut self, key: CacheKey) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = LruNode {
                    key,
                    prev: NIL,
                    next: self.head,
                };
                idx
            }
            None => {
                self.nodes.push(LruNode {
                    key,
                    prev: NIL,
                    next: self.head,
                });
                self.nodes.len() - 1
            }
        };

        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn touch(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn remove(&mut self, idx: usize) -> CacheKey {
        self.unlink(idx);
        self.free.push(idx);
        std::mem::take(&mut self.nodes[idx].key)
    }

    fn tail_index(&self) -> Option<usize> {
        (self.tail != NIL).then_some(self.tail)
    }
}

struct CacheState {
    keys: HashMap<CacheKey, KeyEntry>,
    entries: HashMap<ContentId, ContentEntry>,
    lru: LruList,
    current_memory: usize,
    invalidation_id: u64,
}

struct Shared {
    state: Mutex<CacheState>,
    max_memory: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub keys: usize,
    pub unique_contents: usize,
    pub memory_usage: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidation_id: u64,
}

struct Sweeper {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Thread-safe content-addressed LRU cache with TTL expiry.
pub struct ContentCache {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ContentCache {
    /// `max_memory` bounds stored content bytes (not key or list overhead).
    pub fn new(max_memory: usize, ttl: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                keys: HashMap::new(),
                entries: HashMap::new(),
                lru: LruList::new(),
                current_memory: 0,
                invalidation_id: 0,
            }),
            max_memory,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        });

        let sweeper = Self::start_sweeper(Arc::clone(&shared), ttl);

        Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    fn start_sweeper(shared: Arc<Shared>, ttl: Duration) -> Sweeper {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let cadence = (ttl / 2).max(Duration::from_millis(10));
        let handle = std::thread::spawn(move || {
            let ticker = tick(cadence);
            loop {
                select! {
                    recv(ticker) -> _ => Self::sweep(&shared),
                    recv(shutdown_rx) -> _ => break,
                }
            }
        });
        Sweeper {
            shutdown: shutdown_tx,
            handle,
        }
    }

    fn sweep(shared: &Shared) {
        let now = Instant::now();
        let mut state = match shared.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };

        let expired: HashSet<ContentId> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }

        for id in &expired {
            if let Some(entry) = state.entries.remove(id) {
                state.current_memory -= entry.content.len();
            }
        }

        let stale: Vec<(CacheKey, usize)> = state
            .keys
            .iter()
            .filter(|(_, ke)| expired.contains(&ke.content))
            .map(|(key, ke)| (key.clone(), ke.node))
            .collect();
        for (key, node) in stale {
            state.lru.remove(node);
            state.keys.remove(&key);
        }

        shared
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
    }

    /// Look up cached content, refreshing its recency on a hit.
    pub fn get(
        &self,
        token: &CancelToken,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        token.check().map_err(|_| CacheError::Cancelled)?;

        let key = CacheKey::new(repo, branch, path);
        let mut state = self.shared.state.lock().expect("cache mutex poisoned");

        let Some(key_entry) = state.keys.get(&key) else {
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let content_id = key_entry.content;
        let node = key_entry.node;

        let now = Instant::now();
        let expired = match state.entries.get(&content_id) {
            Some(entry) => entry.expires_at <= now,
            // Entry already swept out from under this key.
            None => true,
        };

        if expired {
            if let Some(entry) = state.entries.remove(&content_id) {
                state.current_memory -= entry.content.len();
                self.shared.expirations.fetch_add(1, Ordering::Relaxed);
            }
            state.lru.remove(node);
            state.keys.remove(&key);
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let entry = state
            .entries
            .get_mut(&content_id)
            .expect("checked entry disappeared");
        entry.accessed_at = now;
        let content = Arc::clone(&entry.content);
        state.lru.touch(node);

        self.shared.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(content))
    }

    /// Insert content for a key, deduplicating by hash and evicting LRU keys
    /// until the memory budget holds.
    pub fn put(
        &self,
        token: &CancelToken,
        repo: &str,
        branch: &str,
        path: &str,
        content: Vec<u8>,
    ) -> Result<(), CacheError> {
        token.check().map_err(|_| CacheError::Cancelled)?;

        if content.len() > self.shared.max_memory {
            return Err(CacheError::ContentTooLarge {
                size: content.len(),
                max: self.shared.max_memory,
            });
        }

        let content_id: ContentId = Sha256::digest(&content).into();
        let key = CacheKey::new(repo, branch, path);
        let now = Instant::now();
        let expires_at = now + self.shared.ttl;

        let mut state = self.shared.state.lock().expect("cache mutex poisoned");

        // Rebind: if the key already points at different content, unbind it
        // first; if it already points at this content, just refresh.
        let prior = state.keys.get(&key).map(|ke| (ke.content, ke.node));
        if let Some((old_id, node)) = prior {
            if old_id == content_id {
                if let Some(entry) = state.entries.get_mut(&content_id) {
                    entry.expires_at = expires_at;
                    entry.accessed_at = now;
                }
                state.lru.touch(node);
                return Ok(());
            }
            state.lru.remove(node);
            state.keys.remove(&key);
            Self::release_content(&mut state, old_id);
        }

        if let Some(entry) = state.entries.get_mut(&content_id) {
            entry.refs += 1;
            entry.expires_at = expires_at;
            entry.accessed_at = now;
        } else {
            while state.current_memory + content.len() > self.shared.max_memory {
                let Some(tail) = state.lru.tail_index() else {
                    break;
                };
                let evicted_key = state.lru.remove(tail);
                if let Some(key_entry) = state.keys.remove(&evicted_key) {
                    Self::release_content(&mut state, key_entry.content);
                }
                self.shared.evictions.fetch_add(1, Ordering::Relaxed);
            }
            state.current_memory += content.len();
            state.entries.insert(
                content_id,
                ContentEntry {
                    content: Arc::new(content),
                    refs: 1,
                    created_at: now,
                    accessed_at: now,
                    expires_at,
                },
            );
        }

        let node = state.lru.push_front(key.clone());
        state.keys.insert(
            key,
            KeyEntry {
                content: content_id,
                node,
            },
        );

        Ok(())
    }

    fn release_content(state: &mut CacheState, id: ContentId) {
        let free = match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if free && let Some(entry) = state.entries.remove(&id) {
            state.current_memory -= entry.content.len();
        }
    }

    /// Bulk insert, checking for cancellation every hundred entries.
    pub fn warm(
        &self,
        token: &CancelToken,
        repo: &str,
        branch: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<usize, CacheError> {
        let mut inserted = 0;
        for (index, (path, content)) in files.into_iter().enumerate() {
            if index % 100 == 0 {
                token.check().map_err(|_| CacheError::Cancelled)?;
            }
            match self.put(token, repo, branch, &path, content) {
                Ok(()) => inserted += 1,
                Err(CacheError::ContentTooLarge { size, max }) => {
                    log::warn!("skipping {path} while warming cache: {size} bytes exceeds {max}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(inserted)
    }

    /// Drop every key under `(repo, branch)`, releasing content refs.
    pub fn invalidate(&self, repo: &str, branch: &str) -> usize {
        let mut state = self.shared.state.lock().expect("cache mutex poisoned");

        let doomed: Vec<(CacheKey, usize, ContentId)> = state
            .keys
            .iter()
            .filter(|(key, _)| key.repo == repo && key.branch == branch)
            .map(|(key, ke)| (key.clone(), ke.node, ke.content))
            .collect();

        for (key, node, content_id) in &doomed {
            state.lru.remove(*node);
            state.keys.remove(key);
            Self::release_content(&mut state, *content_id);
        }

        doomed.len()
    }

    /// Wipe the whole cache and bump the invalidation generation.
    pub fn invalidate_all(&self) {
        let mut state = self.shared.state.lock().expect("cache mutex poisoned");
        state.keys.clear();
        state.entries.clear();
        state.lru = LruList::new();
        state.current_memory = 0;
        state.invalidation_id += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock().expect("cache mutex poisoned");
        CacheStats {
            keys: state.keys.len(),
            unique_contents: state.entries.len(),
            memory_usage: state.current_memory,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            expirations: self.shared.expirations.load(Ordering::Relaxed),
            invalidation_id: state.invalidation_id,
        }
    }

    /// Age of the oldest entry, used by tests and diagnostics.
    pub fn oldest_entry_age(&self) -> Option<Duration> {
        let state = self.shared.state.lock().expect("cache mutex poisoned");
        state
            .entries
            .values()
            .map(|entry| entry.created_at.elapsed())
            .max()
    }

    /// Stop the sweeper thread. Idempotent; also invoked from `Drop`.
    pub fn close(&self) {
        let sweeper = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(sweeper) = sweeper {
            drop(sweeper.shutdown);
            let _ = sweeper.handle.join();
        }
    }
}

impl Drop for ContentCache {
    fn drop(&mut self) {
        self.close();
    }
}
