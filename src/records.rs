//! Stream records, dataset metadata, and query descriptors
//!
//! The record layout mirrors what a distributed stream system would carry on
//! the wire: a stream id, the id of the site that observed the tuple, a key,
//! a signed multiplicity and a timestamp. Records are `Copy` and flow through
//! the simulation by value.
//!
//! ## Invariants
//!
//! - Records are delivered to the simulation in non-decreasing `ts` order,
//!   exactly once.
//! - `StreamMetadata` is computed by a full pass over the data before any
//!   protocol starts; protocols dimension their site tables from it.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The key type of a stream record.
pub type Key = i32;

/// Stream identifier.
pub type StreamId = i16;

/// Identifier of a distributed stream source (a site).
pub type SourceId = i16;

/// Timestamp attribute of a record. A pure stream attribute; there is no
/// wall-clock anywhere in the simulation.
pub type Timestamp = i32;

/// Wire size of a raw `(key, upd)` update pair, in bytes.
pub const UPDATE_BYTES: usize = 8;

/// A stream tuple with a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Stream id.
    pub sid: StreamId,
    /// Local host (site) id.
    pub hid: SourceId,
    /// Record key.
    pub key: Key,
    /// Signed multiplicity: positive for insertions, negative for deletions.
    pub upd: i32,
    /// Timestamp.
    pub ts: Timestamp,
}

impl StreamRecord {
    /// Shorthand constructor in field order `(sid, hid, key, upd, ts)`.
    pub fn new(sid: StreamId, hid: SourceId, key: Key, upd: i32, ts: Timestamp) -> Self {
        Self { sid, hid, key, upd, ts }
    }
}

impl fmt::Display for StreamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{},{}[{}],ts={} at {}>",
            self.sid,
            if self.upd >= 0 { "INS" } else { "DEL" },
            self.key,
            self.ts,
            self.hid
        )
    }
}

/// Data stream metadata needed by the monitoring algorithms: which streams
/// and sites exist, how many records there are, and the key/time ranges.
#[derive(Debug, Clone, Default)]
pub struct StreamMetadata {
    sids: BTreeSet<StreamId>,
    hids: BTreeSet<SourceId>,
    count: usize,
    ts: Timestamp,
    te: Timestamp,
    kmin: Key,
    kmax: Key,
}

impl StreamMetadata {
    /// Empty metadata; populate with [`collect`](Self::collect).
    pub fn new() -> Self {
        Self { kmin: Key::MAX, kmax: Key::MIN, ..Default::default() }
    }

    /// Fold one record into the metadata.
    pub fn collect(&mut self, rec: &StreamRecord) {
        if self.count == 0 {
            self.ts = rec.ts;
        }
        self.te = rec.ts;
        self.sids.insert(rec.sid);
        self.hids.insert(rec.hid);
        self.kmin = self.kmin.min(rec.key);
        self.kmax = self.kmax.max(rec.key);
        self.count += 1;
    }

    /// Total number of records seen.
    pub fn size(&self) -> usize {
        self.count
    }

    /// First and last timestamps.
    pub fn time_range(&self) -> (Timestamp, Timestamp) {
        (self.ts, self.te)
    }

    /// Smallest and largest keys.
    pub fn key_range(&self) -> (Key, Key) {
        (self.kmin, self.kmax)
    }

    /// The set of stream ids present in the data.
    pub fn stream_ids(&self) -> &BTreeSet<StreamId> {
        &self.sids
    }

    /// The set of source (site) ids present in the data.
    pub fn source_ids(&self) -> &BTreeSet<SourceId> {
        &self.hids
    }

    /// Override the source-id set (used when a generator knows its site
    /// population up front, before any record is drawn).
    pub fn set_source_range(&mut self, lo: SourceId, hi: SourceId) {
        self.hids = (lo..=hi).collect();
    }

    /// Override the stream-id set.
    pub fn set_stream_range(&mut self, lo: StreamId, hi: StreamId) {
        self.sids = (lo..=hi).collect();
    }

    /// Override the declared record count.
    pub fn set_size(&mut self, n: usize) {
        self.count = n;
    }

    /// Override the timestamp range.
    pub fn set_ts_range(&mut self, ts: Timestamp, te: Timestamp) {
        self.ts = ts;
        self.te = te;
    }

    /// Override the key range.
    pub fn set_key_range(&mut self, kmin: Key, kmax: Key) {
        self.kmin = kmin;
        self.kmax = kmax;
    }
}

/// The global query types answered by the monitoring protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryKind {
    /// The trivial query.
    Void,
    /// Second frequency moment of one stream.
    Selfjoin,
    /// Inner product (join size) of two streams.
    Join,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Void => write!(f, "VOID"),
            QueryKind::Selfjoin => write!(f, "SELFJOIN"),
            QueryKind::Join => write!(f, "JOIN"),
        }
    }
}

/// A global query descriptor: the query type, its operand streams and the
/// requested approximation factor β.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamQuery {
    /// The query type.
    pub kind: QueryKind,
    /// Operand stream ids (1 for selfjoin, 2 for join).
    pub operands: Vec<StreamId>,
    /// Approximation factor; 0 means exact.
    pub beta: f64,
}

impl StreamQuery {
    /// A selfjoin query on stream `sid`.
    pub fn self_join(sid: StreamId, beta: f64) -> Self {
        assert!(beta >= 0.0, "approximation factor must be non-negative");
        Self { kind: QueryKind::Selfjoin, operands: vec![sid], beta }
    }

    /// A two-way join query on streams `s1` and `s2`.
    pub fn join(s1: StreamId, s2: StreamId, beta: f64) -> Self {
        assert!(beta >= 0.0, "approximation factor must be non-negative");
        Self { kind: QueryKind::Join, operands: vec![s1, s2], beta }
    }

    /// Number of operand streams.
    pub fn arity(&self) -> usize {
        self.operands.len()
    }

    /// True when no approximation is allowed.
    pub fn exact(&self) -> bool {
        self.beta == 0.0
    }
}

impl fmt::Display for StreamQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, sid) in self.operands.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{sid}")?;
        }
        if self.beta != 0.0 {
            write!(f, ";eps={}", self.beta)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_collects_ranges() {
        let mut md = StreamMetadata::new();
        md.collect(&StreamRecord::new(1, 3, 100, 1, 5));
        md.collect(&StreamRecord::new(2, 1, -7, -1, 9));
        md.collect(&StreamRecord::new(1, 2, 55, 1, 12));

        assert_eq!(md.size(), 3);
        assert_eq!(md.time_range(), (5, 12));
        assert_eq!(md.key_range(), (-7, 100));
        assert_eq!(md.stream_ids().len(), 2);
        assert_eq!(md.source_ids().len(), 3);
    }

    #[test]
    fn query_repr_matches_wire_format() {
        assert_eq!(StreamQuery::self_join(3, 0.5).to_string(), "SELFJOIN(3;eps=0.5)");
        assert_eq!(StreamQuery::join(1, 2, 0.0).to_string(), "JOIN(1,2)");
    }

    #[test]
    fn record_display_distinguishes_ops() {
        let ins = StreamRecord::new(1, 2, 42, 1, 7);
        let del = StreamRecord::new(1, 2, 42, -1, 8);
        assert!(ins.to_string().contains("INS"));
        assert!(del.to_string().contains("DEL"));
    }
}
