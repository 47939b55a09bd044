//! Reassembly of messages split across several transport records.
//!
//! Upstream splits large payloads into fragments, each carrying a base64 slice
//! of the original bytes:
//!
//! ```text
//! {"chunkId":"c42","index":2,"total":3,"payload":"…"}  ─┐
//! {"chunkId":"c42","index":0,"total":3,"payload":"…"}   ├─► ChunkAssembler ─► text
//! {"chunkId":"c42","index":1,"total":3,"payload":"…"}  ─┘   (index order)
//! ```
//!
//! Fragments may arrive in any order and may be re-delivered. A sequence is
//! emitted once every index `0..total` is present, as the byte-exact
//! concatenation of the parts in index order.
//!
//! Open buffers are bounded by an [`AssemblyPolicy`]: a capacity (oldest buffer
//! evicted first), a maximum age, and a maximum part count. Completed chunk
//! identifiers are retired for the rest of the session, so a late duplicate
//! can never open a fresh buffer that would never complete.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// A fragment could not be accepted. The fragment is dropped.
#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("fragment has no chunk id")]
    MissingChunkId,
    #[error("malformed fragment record: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("fragment {chunk_id}#{index}: invalid payload: {source}")]
    Payload {
        chunk_id: String,
        index: u32,
        #[source]
        source: base64::DecodeError,
    },
    #[error("fragment {chunk_id}#{index} is outside the declared total of {total}")]
    IndexOutOfRange {
        chunk_id: String,
        index: u32,
        total: u32,
    },
    #[error("fragment {chunk_id} needs {parts} parts, the limit is {limit}")]
    TooManyParts {
        chunk_id: String,
        parts: u32,
        limit: u32,
    },
    #[error("chunk id {0} was already completed in this session")]
    RetiredChunkId(String),
    #[error("reassembled chunk {chunk_id} is not valid UTF-8: {source}")]
    Utf8 {
        chunk_id: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// One part of a multi-part message, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    #[serde(default, deserialize_with = "lenient_id")]
    pub chunk_id: Option<String>,
    /// Zero-based part index; absent means 0
    #[serde(default)]
    pub index: Option<u32>,
    /// Declared part count; absent or 0 means not yet known
    #[serde(default)]
    pub total: Option<u32>,
    /// Base64-encoded slice of the message bytes
    #[serde(default)]
    pub payload: Option<String>,
}

/// Accepts string or numeric ids; an empty string counts as absent.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) if !id.is_empty() => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}

impl Fragment {
    /// Parse a fragment record from its JSON text.
    pub fn parse(text: &str) -> Result<Self, AssemblyError> {
        serde_json::from_str(text).map_err(AssemblyError::Malformed)
    }

    /// Build a fragment carrying `bytes` as its payload.
    pub fn encode(chunk_id: impl Into<String>, index: u32, total: u32, bytes: &[u8]) -> Self {
        Self {
            chunk_id: Some(chunk_id.into()),
            index: Some(index),
            total: Some(total),
            payload: Some(STANDARD.encode(bytes)),
        }
    }

    /// Split `text` into fragments of at most `part_size` bytes each.
    ///
    /// Splits on byte boundaries, so a multi-byte character may straddle two
    /// fragments; reassembly restores it.
    pub fn split(chunk_id: &str, text: &str, part_size: usize) -> Vec<Self> {
        let parts: Vec<&[u8]> = text.as_bytes().chunks(part_size.max(1)).collect();
        let total = parts.len() as u32;
        parts
            .into_iter()
            .enumerate()
            .map(|(index, bytes)| Self::encode(chunk_id, index as u32, total, bytes))
            .collect()
    }
}

/// Bounds on incomplete sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyPolicy {
    /// Open buffers kept at once; opening one more evicts the oldest
    pub max_pending: usize,
    /// Buffers older than this are evicted
    pub max_age: Duration,
    /// Upper bound for `total` and `index + 1`
    pub max_parts: u32,
    /// Completed ids remembered per session
    pub retired_capacity: usize,
}

impl Default for AssemblyPolicy {
    fn default() -> Self {
        Self {
            max_pending: 64,
            max_age: Duration::from_secs(60),
            max_parts: 4096,
            retired_capacity: 1024,
        }
    }
}

/// Assembler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub completed: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub pending: usize,
}

struct AssemblyBuffer {
    total: u32,
    received: u32,
    parts: Vec<Option<Vec<u8>>>,
    started_at: Instant,
}

impl AssemblyBuffer {
    fn new(total: u32, started_at: Instant) -> Self {
        Self {
            total,
            received: 0,
            parts: Vec::new(),
            started_at,
        }
    }

    /// Store a part; returns whether the index was new.
    fn store(&mut self, index: u32, bytes: Vec<u8>) -> bool {
        let slot = index as usize;
        if self.parts.len() <= slot {
            self.parts.resize(slot + 1, None);
        }
        let fresh = self.parts[slot].is_none();
        self.parts[slot] = Some(bytes);
        if fresh {
            self.received += 1;
        }
        fresh
    }

    fn first_missing(&self) -> Option<u32> {
        (0..self.total).find(|&i| !matches!(self.parts.get(i as usize), Some(Some(_))))
    }

    fn concat(self) -> Vec<u8> {
        let total = self.total as usize;
        let len = self.parts.iter().take(total).flatten().map(Vec::len).sum();
        let mut merged = Vec::with_capacity(len);
        for part in self.parts.into_iter().take(total).flatten() {
            merged.extend_from_slice(&part);
        }
        merged
    }
}

/// Per-session reassembly state: chunk id → partial buffer.
pub struct ChunkAssembler {
    policy: AssemblyPolicy,
    buffers: HashMap<String, AssemblyBuffer>,
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
    stats: AssemblerStats,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(AssemblyPolicy::default())
    }
}

impl ChunkAssembler {
    pub fn new(policy: AssemblyPolicy) -> Self {
        Self {
            policy,
            buffers: HashMap::new(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
            stats: AssemblerStats::default(),
        }
    }

    pub fn policy(&self) -> &AssemblyPolicy {
        &self.policy
    }

    /// Accept one fragment. Returns the complete text once the last missing
    /// part arrives, `Ok(None)` while the sequence is still incomplete.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<String>, AssemblyError> {
        self.push_at(fragment, Instant::now())
    }

    /// [`push`](Self::push) with an explicit clock, for age-based eviction.
    pub fn push_at(
        &mut self,
        fragment: Fragment,
        now: Instant,
    ) -> Result<Option<String>, AssemblyError> {
        let result = self.accept(fragment, now);
        if result.is_err() {
            self.stats.rejected += 1;
        }
        result
    }

    fn accept(&mut self, fragment: Fragment, now: Instant) -> Result<Option<String>, AssemblyError> {
        self.evict_expired(now);

        let chunk_id = fragment.chunk_id.ok_or(AssemblyError::MissingChunkId)?;
        if self.retired.contains(&chunk_id) {
            return Err(AssemblyError::RetiredChunkId(chunk_id));
        }

        let index = fragment.index.unwrap_or(0);
        let declared = fragment.total.unwrap_or(0);
        let limit = self.policy.max_parts;
        if declared > limit || index >= limit {
            return Err(AssemblyError::TooManyParts {
                parts: declared.max(index.saturating_add(1)),
                chunk_id,
                limit,
            });
        }

        let known_total = self
            .buffers
            .get(&chunk_id)
            .map(|buffer| buffer.total)
            .filter(|&total| total > 0)
            .unwrap_or(declared);
        if known_total > 0 && index >= known_total {
            return Err(AssemblyError::IndexOutOfRange {
                chunk_id,
                index,
                total: known_total,
            });
        }

        let payload = fragment.payload.unwrap_or_default();
        let bytes = match STANDARD.decode(payload.trim()) {
            Ok(bytes) => bytes,
            Err(source) => {
                return Err(AssemblyError::Payload {
                    chunk_id,
                    index,
                    source,
                })
            }
        };

        if !self.buffers.contains_key(&chunk_id) && self.buffers.len() >= self.policy.max_pending.max(1) {
            self.evict_oldest();
        }
        let buffer = self.buffers.entry(chunk_id.clone()).or_insert_with(|| {
            log::debug!("[chunk] start id={chunk_id} total={declared}");
            AssemblyBuffer::new(declared, now)
        });

        if declared > 0 {
            if buffer.total == 0 {
                buffer.total = declared;
            } else if buffer.total != declared {
                log::warn!(
                    "[chunk] id={chunk_id} declares total {declared}, keeping {}",
                    buffer.total
                );
            }
        }

        if !buffer.store(index, bytes) {
            log::debug!("[chunk] id={chunk_id} part {index} re-delivered");
        }
        log::debug!(
            "[chunk] received id={chunk_id} part={}/{} received={}",
            index + 1,
            buffer.total,
            buffer.received
        );

        if buffer.total == 0 || buffer.received < buffer.total {
            return Ok(None);
        }
        if let Some(missing) = buffer.first_missing() {
            log::warn!("[chunk] sequence incomplete id={chunk_id}, part {missing} missing");
            return Ok(None);
        }

        let Some(buffer) = self.buffers.remove(&chunk_id) else {
            return Ok(None);
        };
        self.retire(chunk_id.clone());
        self.stats.completed += 1;

        let merged = buffer.concat();
        log::debug!("[chunk] complete id={chunk_id} size={}", merged.len());
        String::from_utf8(merged)
            .map(Some)
            .map_err(|source| AssemblyError::Utf8 { chunk_id, source })
    }

    /// Drop buffers older than the policy's `max_age`.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let max_age = self.policy.max_age;
        let before = self.buffers.len();
        self.buffers.retain(|chunk_id, buffer| {
            let keep = now.saturating_duration_since(buffer.started_at) < max_age;
            if !keep {
                log::warn!(
                    "[chunk] evicting stale id={chunk_id} ({}/{} parts)",
                    buffer.received,
                    buffer.total
                );
            }
            keep
        });
        let evicted = before - self.buffers.len();
        self.stats.evicted += evicted as u64;
        evicted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.started_at)
            .map(|(chunk_id, _)| chunk_id.clone());
        if let Some(chunk_id) = oldest {
            log::warn!("[chunk] capacity reached, evicting id={chunk_id}");
            self.buffers.remove(&chunk_id);
            self.stats.evicted += 1;
        }
    }

    fn retire(&mut self, chunk_id: String) {
        if self.policy.retired_capacity == 0 {
            return;
        }
        if self.retired_order.len() >= self.policy.retired_capacity {
            if let Some(expired) = self.retired_order.pop_front() {
                self.retired.remove(&expired);
            }
        }
        self.retired.insert(chunk_id.clone());
        self.retired_order.push_back(chunk_id);
    }

    /// Forget all buffers and retired ids; a new session starts a fresh
    /// identifier space.
    pub fn reset(&mut self) {
        if !self.buffers.is_empty() {
            log::debug!("[chunk] dropping {} incomplete sequence(s)", self.buffers.len());
        }
        self.buffers.clear();
        self.retired.clear();
        self.retired_order.clear();
    }

    /// Number of open buffers.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> AssemblerStats {
        AssemblerStats {
            pending: self.buffers.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(chunk_id: &str, index: u32, total: u32, part: &str) -> Fragment {
        Fragment::encode(chunk_id, index, total, part.as_bytes())
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut assembler = ChunkAssembler::default();

        assert_eq!(assembler.push(frag("c1", 2, 3, "baz")).unwrap(), None);
        assert_eq!(assembler.push(frag("c1", 0, 3, "foo")).unwrap(), None);
        let merged = assembler.push(frag("c1", 1, 3, "bar")).unwrap();

        assert_eq!(merged.as_deref(), Some("foobarbaz"));
        assert_eq!(assembler.pending(), 0);
        assert_eq!(assembler.stats().completed, 1);
    }

    #[test]
    fn test_incomplete_sequence_emits_nothing() {
        let mut assembler = ChunkAssembler::default();

        assert_eq!(assembler.push(frag("c1", 0, 3, "a")).unwrap(), None);
        assert_eq!(assembler.push(frag("c1", 1, 3, "b")).unwrap(), None);

        assert_eq!(assembler.pending(), 1);
        assert_eq!(assembler.stats().completed, 0);
    }

    #[test]
    fn test_redelivery_does_not_double_count() {
        let mut assembler = ChunkAssembler::default();

        assert_eq!(assembler.push(frag("c1", 0, 2, "a")).unwrap(), None);
        assert_eq!(assembler.push(frag("c1", 0, 2, "a")).unwrap(), None);
        assert_eq!(assembler.push(frag("c1", 1, 2, "b")).unwrap().as_deref(), Some("ab"));
    }

    #[test]
    fn test_multibyte_character_split_across_parts() {
        let text = r#"{"Athletes":{"1":{"Name":"Zoë Müller"}}}"#;
        let mut assembler = ChunkAssembler::default();
        let mut fragments = Fragment::split("c9", text, 5);
        fragments.reverse();

        let mut emitted = Vec::new();
        for fragment in fragments {
            if let Some(merged) = assembler.push(fragment).unwrap() {
                emitted.push(merged);
            }
        }
        assert_eq!(emitted, vec![text.to_string()]);
    }

    #[test]
    fn test_total_adopted_from_later_fragment() {
        let mut assembler = ChunkAssembler::default();
        let mut first = frag("c1", 0, 0, "x");
        first.total = None;

        assert_eq!(assembler.push(first).unwrap(), None);
        assert_eq!(assembler.push(frag("c1", 1, 2, "y")).unwrap().as_deref(), Some("xy"));
    }

    #[test]
    fn test_conflicting_total_ignored() {
        let mut assembler = ChunkAssembler::default();

        assert_eq!(assembler.push(frag("c1", 0, 3, "a")).unwrap(), None);
        // Two parts received against a declared 2 would complete if adopted.
        assert_eq!(assembler.push(frag("c1", 1, 2, "b")).unwrap(), None);
        assert_eq!(assembler.pending(), 1);

        let merged = assembler.push(frag("c1", 2, 3, "c")).unwrap();
        assert_eq!(merged.as_deref(), Some("abc"));
        assert_eq!(assembler.stats().rejected, 0);
    }

    #[test]
    fn test_count_satisfied_with_gap_retains_buffer() {
        let mut assembler = ChunkAssembler::default();
        let unknown = |index, part| Fragment {
            total: None,
            ..frag("c1", index, 0, part)
        };

        // Parts 0 and 3 arrive before the total is known.
        assert_eq!(assembler.push(unknown(0, "a")).unwrap(), None);
        assert_eq!(assembler.push(unknown(3, "d")).unwrap(), None);
        // Three distinct parts received, total 3, but part 2 is missing.
        assert_eq!(assembler.push(frag("c1", 1, 3, "b")).unwrap(), None);
        assert_eq!(assembler.pending(), 1);

        let merged = assembler.push(frag("c1", 2, 3, "c")).unwrap();
        assert_eq!(merged.as_deref(), Some("abc"));
    }

    #[test]
    fn test_missing_chunk_id_rejected() {
        let mut assembler = ChunkAssembler::default();
        let fragment = Fragment::parse(r#"{"index":0,"total":1,"payload":"YQ=="}"#).unwrap();

        assert!(matches!(assembler.push(fragment), Err(AssemblyError::MissingChunkId)));
        assert_eq!(assembler.stats().rejected, 1);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_numeric_chunk_id_accepted() {
        let fragment = Fragment::parse(r#"{"chunkId":42,"index":0,"total":1,"payload":"YQ=="}"#).unwrap();
        assert_eq!(fragment.chunk_id.as_deref(), Some("42"));

        let empty = Fragment::parse(r#"{"chunkId":"","payload":""}"#).unwrap();
        assert_eq!(empty.chunk_id, None);
    }

    #[test]
    fn test_bad_payload_leaves_counters_untouched() {
        let mut assembler = ChunkAssembler::default();
        assert_eq!(assembler.push(frag("c1", 0, 2, "a")).unwrap(), None);

        let bad = Fragment {
            payload: Some("@@not base64@@".to_string()),
            ..frag("c1", 1, 2, "")
        };
        assert!(matches!(assembler.push(bad), Err(AssemblyError::Payload { index: 1, .. })));

        assert_eq!(assembler.push(frag("c1", 1, 2, "b")).unwrap().as_deref(), Some("ab"));
    }

    #[test]
    fn test_index_beyond_total_rejected() {
        let mut assembler = ChunkAssembler::default();
        assert!(matches!(
            assembler.push(frag("c1", 3, 3, "x")),
            Err(AssemblyError::IndexOutOfRange { index: 3, total: 3, .. })
        ));
    }

    #[test]
    fn test_part_limit_enforced() {
        let mut assembler = ChunkAssembler::new(AssemblyPolicy {
            max_parts: 4,
            ..AssemblyPolicy::default()
        });
        assert!(matches!(
            assembler.push(frag("c1", 0, 5, "x")),
            Err(AssemblyError::TooManyParts { limit: 4, .. })
        ));
        let mut unknown = frag("c2", 4, 0, "x");
        unknown.total = None;
        assert!(matches!(assembler.push(unknown), Err(AssemblyError::TooManyParts { .. })));
    }

    #[test]
    fn test_completed_id_is_retired() {
        let mut assembler = ChunkAssembler::default();
        assert!(assembler.push(frag("c1", 0, 1, "a")).unwrap().is_some());

        // A late duplicate must not open a buffer that can never complete.
        assert!(matches!(
            assembler.push(frag("c1", 0, 1, "a")),
            Err(AssemblyError::RetiredChunkId(_))
        ));
        assert_eq!(assembler.pending(), 0);

        assembler.reset();
        assert_eq!(assembler.push(frag("c1", 0, 1, "b")).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_retired_ids_bounded() {
        let mut assembler = ChunkAssembler::new(AssemblyPolicy {
            retired_capacity: 2,
            ..AssemblyPolicy::default()
        });
        for id in ["a", "b", "c"] {
            assert!(assembler.push(frag(id, 0, 1, id)).unwrap().is_some());
        }
        // "a" fell out of the retired window.
        assert!(assembler.push(frag("a", 0, 1, "again")).unwrap().is_some());
        assert!(assembler.push(frag("c", 0, 1, "again")).is_err());
    }

    #[test]
    fn test_stale_buffers_evicted_by_age() {
        let mut assembler = ChunkAssembler::new(AssemblyPolicy {
            max_age: Duration::from_secs(10),
            ..AssemblyPolicy::default()
        });
        let start = Instant::now();

        assembler.push_at(frag("old", 0, 2, "a"), start).unwrap();
        assert_eq!(assembler.pending(), 1);

        assembler
            .push_at(frag("new", 0, 2, "x"), start + Duration::from_secs(11))
            .unwrap();
        assert_eq!(assembler.pending(), 1);
        assert_eq!(assembler.stats().evicted, 1);

        // The evicted sequence restarts from scratch.
        let late = assembler
            .push_at(frag("old", 1, 2, "b"), start + Duration::from_secs(12))
            .unwrap();
        assert_eq!(late, None);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut assembler = ChunkAssembler::new(AssemblyPolicy {
            max_pending: 2,
            ..AssemblyPolicy::default()
        });
        let start = Instant::now();

        assembler.push_at(frag("a", 0, 2, "a"), start).unwrap();
        assembler
            .push_at(frag("b", 0, 2, "b"), start + Duration::from_millis(1))
            .unwrap();
        assembler
            .push_at(frag("c", 0, 2, "c"), start + Duration::from_millis(2))
            .unwrap();

        assert_eq!(assembler.pending(), 2);
        assert_eq!(assembler.stats().evicted, 1);
        // "b" survived and can still complete.
        let merged = assembler
            .push_at(frag("b", 1, 2, "B"), start + Duration::from_millis(3))
            .unwrap();
        assert_eq!(merged.as_deref(), Some("bB"));
    }

    #[test]
    fn test_invalid_utf8_reported() {
        let mut assembler = ChunkAssembler::default();
        let fragment = Fragment::encode("c1", 0, 1, &[0xFF, 0xFE]);
        assert!(matches!(assembler.push(fragment), Err(AssemblyError::Utf8 { .. })));
        assert_eq!(assembler.pending(), 0);
    }
}
