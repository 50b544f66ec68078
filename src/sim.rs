//! The simulation world: data feeding, ECA wiring, reporting
//!
//! One [`Simulation`] owns the rule engine, the data source and any number
//! of protocol networks, and drives the canonical run grammar:
//!
//! ```text
//! run    -> INIT streamproc RESULTS DONE
//! streamproc -> START_STREAM record* END_STREAM
//! record -> START_RECORD VALIDATE REPORT END_RECORD
//! ```
//!
//! Networks attach to the grammar through ECA rules; the Qest timeseries is
//! sampled by a condition on `REPORT`. Everything is deterministic: the
//! same data-source and hash seeds reproduce a run bit for bit.

use crate::data::DataSource;
use crate::eca::{
    Ctl, Engine, NTimesOutOfN, DONE, END_RECORD, END_STREAM, INIT, REPORT, RESULTS, START_RECORD,
    START_STREAM, VALIDATE,
};
use crate::proto::GmResultRow;
use crate::query::ContinuousQuery;
use crate::records::{SourceId, StreamMetadata, StreamRecord, Timestamp};
use crate::{agm, fgm, frgm, sgm, tods};

use std::rc::Rc;

/// The uniform driving surface of the simulated protocol networks.
pub trait ProtocolNetwork {
    /// Network display name.
    fn name(&self) -> &str;
    /// Load the warmup prefix and start the first round.
    fn process_init(&mut self, warmup: &[StreamRecord]);
    /// Deliver one stream record.
    fn process_record(&mut self, rec: StreamRecord);
    /// End of stream: close the final round.
    fn process_fini(&mut self);
    /// Current global query estimate.
    fn qest(&self) -> f64;
    /// The aggregate result row.
    fn results(&self, run_id: &str, stream_count: usize) -> GmResultRow;
}

macro_rules! impl_protocol_network {
    ($ty:ty) => {
        impl ProtocolNetwork for $ty {
            fn name(&self) -> &str {
                <$ty>::name(self)
            }
            fn process_init(&mut self, warmup: &[StreamRecord]) {
                self.warmup(warmup);
                self.start_round();
            }
            fn process_record(&mut self, rec: StreamRecord) {
                <$ty>::process_record(self, rec)
            }
            fn process_fini(&mut self) {
                self.finish_rounds();
            }
            fn qest(&self) -> f64 {
                <$ty>::qest(self)
            }
            fn results(&self, run_id: &str, stream_count: usize) -> GmResultRow {
                <$ty>::results(self, run_id, stream_count)
            }
        }
    };
}

impl_protocol_network!(sgm::Network);
impl_protocol_network!(agm::Network);
impl_protocol_network!(fgm::Network);
impl_protocol_network!(frgm::Network);
impl_protocol_network!(tods::Network);

/// The protocol variants this crate simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GmVariant {
    Sgm,
    Agm,
    Fgm,
    Frgm,
    Tods,
}

/// Build a network of the given variant over the query's site set.
pub fn make_network(
    variant: GmVariant,
    name: &str,
    q: Rc<ContinuousQuery>,
    sites: &[SourceId],
) -> anyhow::Result<Box<dyn ProtocolNetwork>> {
    Ok(match variant {
        GmVariant::Sgm => Box::new(sgm::Network::new(name, q, sites)?),
        GmVariant::Agm => Box::new(agm::Network::new(name, q, sites)?),
        GmVariant::Fgm => Box::new(fgm::Network::new(name, q, sites)?),
        GmVariant::Frgm => Box::new(frgm::Network::new(name, q, sites)?),
        GmVariant::Tods => Box::new(tods::Network::new(name, q, sites)?),
    })
}

/// One sample of a network's query estimate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimeseriesRow {
    pub ts: Timestamp,
    pub name: String,
    pub qest: f64,
}

/// Everything the ECA rules operate on.
pub struct World {
    /// Warmup prefix applied to the estimate before rounds begin.
    pub warmup: Vec<StreamRecord>,
    /// The record currently being dispatched.
    pub cur: StreamRecord,
    /// Timestamp of the current record.
    pub now: Timestamp,
    /// Records consumed so far.
    pub stream_count: usize,
    /// Metadata of the driven stream.
    pub metadata: StreamMetadata,
    /// The monitored networks.
    pub networks: Vec<Box<dyn ProtocolNetwork>>,
    /// Collected Qest samples.
    pub timeseries: Vec<TimeseriesRow>,
    /// Collected result rows.
    pub results: Vec<GmResultRow>,
    /// Identifier stamped into result rows.
    pub run_id: String,
}

/// The simulation driver: engine + world + data source.
pub struct Simulation {
    engine: Engine<World>,
    world: World,
    ds: Option<Box<dyn DataSource>>,
}

impl Simulation {
    pub fn new(run_id: &str) -> Self {
        Self {
            engine: Engine::new(),
            world: World {
                warmup: Vec::new(),
                cur: StreamRecord::new(0, 0, 0, 0, 0),
                now: 0,
                stream_count: 0,
                metadata: StreamMetadata::new(),
                networks: Vec::new(),
                timeseries: Vec::new(),
                results: Vec::new(),
                run_id: run_id.to_string(),
            },
            ds: None,
        }
    }

    /// Attach the data source; its metadata dimensions the site tables.
    pub fn data_feed(&mut self, src: Box<dyn DataSource>) {
        if let Some(md) = src.metadata() {
            self.world.metadata = md.clone();
        }
        self.ds = Some(src);
    }

    /// Supply a warmup prefix (applied at `INIT`, before the first round).
    pub fn set_warmup(&mut self, warmup: Vec<StreamRecord>) {
        self.world.warmup = warmup;
    }

    /// The metadata of the attached source.
    pub fn metadata(&self) -> &StreamMetadata {
        &self.world.metadata
    }

    /// Direct access to the rule engine, for custom rules.
    pub fn engine(&mut self) -> &mut Engine<World> {
        &mut self.engine
    }

    /// Register a network and wire it into the run grammar.
    pub fn add_network(&mut self, net: Box<dyn ProtocolNetwork>) {
        let n = self.world.networks.len();
        self.world.networks.push(net);

        self.engine.on(INIT, move |w: &mut World, _: &mut Ctl| {
            let World { networks, warmup, .. } = w;
            networks[n].process_init(warmup);
        });
        self.engine.on(START_RECORD, move |w: &mut World, _: &mut Ctl| {
            let rec = w.cur;
            w.networks[n].process_record(rec);
        });
        self.engine.on(END_STREAM, move |w: &mut World, _: &mut Ctl| {
            w.networks[n].process_fini();
        });
        self.engine.on(RESULTS, move |w: &mut World, _: &mut Ctl| {
            let World { networks, results, run_id, stream_count, .. } = w;
            results.push(networks[n].results(run_id, *stream_count));
        });
    }

    /// Sample every network's Qest `samples` times, evenly spread over the
    /// declared stream length.
    pub fn sample_timeseries(&mut self, samples: usize) {
        let total = self.world.metadata.size().max(1);
        let mut cond = NTimesOutOfN::new(samples.min(total), total);
        self.engine.on(REPORT, move |w: &mut World, _: &mut Ctl| {
            if cond.check() {
                let World { networks, timeseries, now, .. } = w;
                for net in networks.iter() {
                    timeseries.push(TimeseriesRow {
                        ts: *now,
                        name: net.name().to_string(),
                        qest: net.qest(),
                    });
                }
            }
        });
    }

    /// Drive the full run grammar to completion and return the world.
    pub fn run(mut self) -> World {
        self.engine.emit(INIT);
        self.engine.run(&mut self.world);

        if let Some(mut ds) = self.ds.take() {
            self.engine.emit(START_STREAM);
            self.engine.run(&mut self.world);

            while ds.valid() {
                self.world.cur = ds.get();
                self.world.now = self.world.cur.ts;
                self.world.stream_count += 1;

                self.engine.emit(START_RECORD);
                self.engine.emit(VALIDATE);
                self.engine.emit(REPORT);
                self.engine.emit(END_RECORD);
                self.engine.run(&mut self.world);

                ds.advance();
            }

            self.engine.emit(END_STREAM);
            self.engine.run(&mut self.world);
        }

        self.engine.emit(RESULTS);
        self.engine.run(&mut self.world);
        self.engine.emit(DONE);
        self.engine.run(&mut self.world);

        self.world
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{make_uniform_dataset, BufferedDataSource};
    use crate::proto::{ProtocolConfig, Rebalancing};
    use crate::records::StreamQuery;
    use crate::sketch::{HashFamilyRegistry, Projection};
    use std::collections::HashMap;

    const SEED: u64 = 24534623;

    fn true_selfjoin(records: &[StreamRecord], sid: i16) -> f64 {
        let mut freq: HashMap<i32, i64> = HashMap::new();
        for rec in records {
            if rec.sid == sid {
                *freq.entry(rec.key).or_default() += rec.upd as i64;
            }
        }
        freq.values().map(|&f| (f * f) as f64).sum()
    }

    fn run_one(
        variant: GmVariant,
        config: ProtocolConfig,
        maxts: i32,
    ) -> (World, f64) {
        let dataset = make_uniform_dataset(1, 10, 1000, maxts, SEED);
        let exact = true_selfjoin(dataset.records(), 1);

        let reg = HashFamilyRegistry::with_seed(SEED);
        let proj = Projection::from_registry(&reg, 5, 400);

        let src = BufferedDataSource::new(dataset);
        let mut sim = Simulation::new("test");
        sim.data_feed(Box::new(src));

        let sites: Vec<i16> = sim.metadata().source_ids().iter().copied().collect();
        let q = Rc::new(
            ContinuousQuery::new_r(&StreamQuery::self_join(1, 0.5), proj, sites.len(), config)
                .unwrap(),
        );
        let net = make_network(variant, "nw", q, &sites).unwrap();
        sim.add_network(net);
        sim.sample_timeseries(20);

        (sim.run(), exact)
    }

    #[test]
    fn sgm_uniform_run_tracks_the_query() {
        let config = ProtocolConfig {
            rebalance_algorithm: Rebalancing::RandomLimits,
            ..Default::default()
        };
        let (world, exact) = run_one(GmVariant::Sgm, config, 1000);

        assert_eq!(world.results.len(), 1);
        let row = &world.results[0];
        assert!(row.rounds >= 1, "at least one round must have completed");
        assert_eq!(row.sites, 10);
        assert_eq!(row.total_updates, 1000);

        let qest = world.networks[0].qest();
        let rel = (qest - exact).abs() / exact;
        assert!(rel <= 0.5, "Qest {qest} deviates from {exact} by {rel}");
        assert!(!world.timeseries.is_empty());
    }

    #[test]
    fn fgm_cost_model_run_bounds_safezone_traffic() {
        let (world, exact) = run_one(GmVariant::Fgm, ProtocolConfig::default(), 1000);
        let row = &world.results[0];
        assert!(row.rounds >= 1);
        assert!(
            row.sz_sent <= row.rounds * row.sites,
            "sz_sent {} exceeds rounds·k {}",
            row.sz_sent,
            row.rounds * row.sites
        );
        assert!(row.bytes_get_drift > 0, "drift responses must carry bytes");
        assert!(row.tcp_traffic >= row.bytes_get_drift);
        assert!(row.tcp_traffic_pct > 0.0);

        let qest = world.networks[0].qest();
        assert!((qest - exact).abs() / exact <= 0.5);
    }

    #[test]
    fn agm_and_frgm_complete_and_report() {
        for variant in [GmVariant::Agm, GmVariant::Frgm] {
            let config = ProtocolConfig {
                rebalance_algorithm: if variant == GmVariant::Frgm {
                    Rebalancing::ZeroBalance
                } else {
                    Rebalancing::None
                },
                ..Default::default()
            };
            let (world, exact) = run_one(variant, config, 1000);
            let row = &world.results[0];
            assert!(row.rounds >= 1, "{variant:?}");
            assert!(row.subrounds >= row.rounds, "{variant:?}");
            let qest = world.networks[0].qest();
            assert!((qest - exact).abs() / exact <= 0.5, "{variant:?}: {qest} vs {exact}");
        }
    }

    #[test]
    fn warmup_prefix_seeds_the_estimate() {
        let mut dataset = make_uniform_dataset(1, 10, 1000, 500, SEED);
        let warm = dataset.split_warmup(200);
        let full_meta = {
            let mut md = dataset.analyze();
            md.set_source_range(1, 10);
            md
        };

        let reg = HashFamilyRegistry::with_seed(SEED);
        let proj = Projection::from_registry(&reg, 5, 400);

        let mut sim = Simulation::new("warm");
        sim.data_feed(Box::new(BufferedDataSource::with_metadata(dataset, full_meta)));
        sim.set_warmup(warm);

        let sites: Vec<i16> = sim.metadata().source_ids().iter().copied().collect();
        let q = Rc::new(
            ContinuousQuery::new_r(
                &StreamQuery::self_join(1, 0.5),
                proj,
                sites.len(),
                ProtocolConfig::default(),
            )
            .unwrap(),
        );
        sim.add_network(make_network(GmVariant::Sgm, "warm-nw", q, &sites).unwrap());
        let world = sim.run();
        // 300 streamed records on top of a warm estimate
        assert_eq!(world.stream_count, 300);
        assert!(world.networks[0].qest() > 0.0);
    }

    #[test]
    fn identical_seeds_reproduce_a_run_bit_for_bit() {
        let config = ProtocolConfig {
            rebalance_algorithm: Rebalancing::RandomLimits,
            ..Default::default()
        };
        let (a, _) = run_one(GmVariant::Sgm, config.clone(), 1000);
        let (b, _) = run_one(GmVariant::Sgm, config, 1000);

        assert_eq!(a.timeseries.len(), b.timeseries.len());
        for (x, y) in a.timeseries.iter().zip(&b.timeseries) {
            assert_eq!(x.ts, y.ts);
            assert!(x.qest == y.qest, "qest diverged at ts {}", x.ts);
        }
        let (ra, rb) = (&a.results[0], &b.results[0]);
        assert_eq!(ra.rounds, rb.rounds);
        assert_eq!(ra.tcp_traffic, rb.tcp_traffic);
        assert_eq!(ra.total_rbl_size, rb.total_rbl_size);
    }

    #[test]
    fn multiple_networks_share_one_stream() {
        // the comparative setup: two protocols and a baseline observe the
        // same records and report into the same world
        let dataset = make_uniform_dataset(1, 10, 1000, 1000, SEED);
        let reg = HashFamilyRegistry::with_seed(SEED);
        let proj = Projection::from_registry(&reg, 5, 400);

        let mut sim = Simulation::new("multi");
        sim.data_feed(Box::new(BufferedDataSource::new(dataset)));
        let sites: Vec<i16> = sim.metadata().source_ids().iter().copied().collect();

        for (variant, name) in
            [(GmVariant::Sgm, "sgm"), (GmVariant::Fgm, "fgm"), (GmVariant::Tods, "tods")]
        {
            let q = Rc::new(
                ContinuousQuery::new_r(
                    &StreamQuery::self_join(1, 0.5),
                    proj.clone(),
                    sites.len(),
                    ProtocolConfig::default(),
                )
                .unwrap(),
            );
            sim.add_network(make_network(variant, name, q, &sites).unwrap());
        }

        let world = sim.run();
        assert_eq!(world.results.len(), 3);
        let protos: Vec<&str> = world.results.iter().map(|r| r.protocol.as_str()).collect();
        assert_eq!(protos, vec!["GM", "FGM", "TODS"]);
        for net in &world.networks {
            assert!(net.qest() > 0.0, "{} produced no estimate", net.name());
        }
    }

    #[test]
    fn join_query_runs_over_two_streams() {
        let dataset = make_uniform_dataset(2, 6, 500, 2000, SEED);
        let reg = HashFamilyRegistry::with_seed(SEED);
        let proj = Projection::from_registry(&reg, 5, 400);

        let mut sim = Simulation::new("join");
        sim.data_feed(Box::new(BufferedDataSource::new(dataset)));
        let sites: Vec<i16> = sim.metadata().source_ids().iter().copied().collect();
        let q = Rc::new(
            ContinuousQuery::new_r(
                &StreamQuery::join(1, 2, 0.5),
                proj,
                sites.len(),
                ProtocolConfig::default(),
            )
            .unwrap(),
        );
        sim.add_network(make_network(GmVariant::Fgm, "join-nw", q, &sites).unwrap());
        let world = sim.run();
        let row = &world.results[0];
        assert_eq!(row.query, "JOIN(1,2;eps=0.5)");
        assert_eq!(row.statevec_size, 2 * 2000);
        assert!(row.rounds >= 1);
        // both streams share keys uniformly: the join estimate is positive
        assert!(world.networks[0].qest() > 0.0);
    }
}
