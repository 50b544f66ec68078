//! Data sources: synthetic generators and buffered datasets
//!
//! A [`DataSource`] yields stream records in non-decreasing timestamp order,
//! exactly once, with iterator-like `valid`/`get`/`advance` semantics. The
//! simulation only ever drives one source; file-format readers live outside
//! this crate and feed in through [`BufferedDataset`].

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::records::{Key, SourceId, StreamId, StreamMetadata, StreamRecord, Timestamp};

/// An iterator-like producer of stream records.
pub trait DataSource {
    /// While true, [`get`](Self::get) returns the current record.
    fn valid(&self) -> bool;

    /// The current record; only meaningful while [`valid`](Self::valid).
    fn get(&self) -> StreamRecord;

    /// Move to the next record.
    fn advance(&mut self);

    /// Metadata, when the source knows it up front.
    fn metadata(&self) -> Option<&StreamMetadata> {
        None
    }
}

/// Generates uniformly random insert records over configured ranges of
/// streams, sites and keys, with one record per timestamp tick.
pub struct UniformDataSource {
    rng: StdRng,
    sid_dist: Uniform<StreamId>,
    hid_dist: Uniform<SourceId>,
    key_dist: Uniform<Key>,
    now: Timestamp,
    maxtime: Timestamp,
    cur: StreamRecord,
    meta: StreamMetadata,
}

impl UniformDataSource {
    /// Records carry `sid ∈ [1, maxsid]`, `hid ∈ [1, maxhid]`,
    /// `key ∈ [1, maxkey]` and timestamps `1..=maxtime`.
    pub fn new(
        maxsid: StreamId,
        maxhid: SourceId,
        maxkey: Key,
        maxtime: Timestamp,
        seed: u64,
    ) -> Self {
        let mut meta = StreamMetadata::new();
        meta.set_size(maxtime as usize);
        meta.set_ts_range(1, maxtime);
        meta.set_key_range(1, maxkey);
        meta.set_stream_range(1, maxsid);
        meta.set_source_range(1, maxhid);

        let mut src = Self {
            rng: StdRng::seed_from_u64(seed),
            sid_dist: Uniform::new_inclusive(1, maxsid),
            hid_dist: Uniform::new_inclusive(1, maxhid),
            key_dist: Uniform::new_inclusive(1, maxkey),
            now: 0,
            maxtime,
            cur: StreamRecord::new(0, 0, 0, 0, 0),
            meta,
        };
        src.advance();
        src
    }

    fn fill(&mut self) {
        self.now += 1;
        self.cur = StreamRecord {
            sid: self.sid_dist.sample(&mut self.rng),
            hid: self.hid_dist.sample(&mut self.rng),
            key: self.key_dist.sample(&mut self.rng),
            upd: 1,
            ts: self.now,
        };
    }
}

impl DataSource for UniformDataSource {
    fn valid(&self) -> bool {
        self.now <= self.maxtime
    }

    fn get(&self) -> StreamRecord {
        debug_assert!(self.valid());
        self.cur
    }

    fn advance(&mut self) {
        if self.now < self.maxtime {
            self.fill();
        } else {
            // step past the end; valid() turns false
            self.now = self.maxtime + 1;
        }
    }

    fn metadata(&self) -> Option<&StreamMetadata> {
        Some(&self.meta)
    }
}

/// A main-memory store of stream records.
#[derive(Debug, Clone, Default)]
pub struct BufferedDataset {
    records: Vec<StreamRecord>,
}

impl BufferedDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain a source into memory.
    pub fn load(src: &mut dyn DataSource) -> Self {
        let mut records = Vec::new();
        while src.valid() {
            records.push(src.get());
            src.advance();
        }
        Self { records }
    }

    /// Records in stream order.
    pub fn records(&self) -> &[StreamRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, rec: StreamRecord) {
        self.records.push(rec);
    }

    /// Metadata of the buffered data, by a full pass.
    pub fn analyze(&self) -> StreamMetadata {
        let mut md = StreamMetadata::new();
        for rec in &self.records {
            md.collect(rec);
        }
        md
    }

    /// Split off the first `n` records as a warmup prefix; `self` keeps the
    /// remainder.
    pub fn split_warmup(&mut self, n: usize) -> Vec<StreamRecord> {
        let n = n.min(self.records.len());
        let rest = self.records.split_off(n);
        std::mem::replace(&mut self.records, rest)
    }
}

/// A uniform dataset materialized into memory.
pub fn make_uniform_dataset(
    maxsid: StreamId,
    maxhid: SourceId,
    maxkey: Key,
    maxtime: Timestamp,
    seed: u64,
) -> BufferedDataset {
    let mut src = UniformDataSource::new(maxsid, maxhid, maxkey, maxtime, seed);
    BufferedDataset::load(&mut src)
}

/// Replays a buffered dataset, carrying metadata computed up front (or
/// supplied by the caller, e.g. when the warmup prefix was split off and
/// should still count toward the declared totals).
pub struct BufferedDataSource {
    data: BufferedDataset,
    meta: StreamMetadata,
    pos: usize,
}

impl BufferedDataSource {
    pub fn new(data: BufferedDataset) -> Self {
        let meta = data.analyze();
        Self { data, meta, pos: 0 }
    }

    pub fn with_metadata(data: BufferedDataset, meta: StreamMetadata) -> Self {
        Self { data, meta, pos: 0 }
    }
}

impl DataSource for BufferedDataSource {
    fn valid(&self) -> bool {
        self.pos < self.data.len()
    }

    fn get(&self) -> StreamRecord {
        self.data.records()[self.pos]
    }

    fn advance(&mut self) {
        if self.pos < self.data.len() {
            self.pos += 1;
        }
    }

    fn metadata(&self) -> Option<&StreamMetadata> {
        Some(&self.meta)
    }
}
