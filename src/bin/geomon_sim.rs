//! Minimal CLI simulation driver
//!
//! Runs one Geometric Method protocol over a synthetic uniform stream and
//! prints the Qest timeseries and the aggregate result row as JSON lines.
//!
//!   geomon_sim --protocol FGM --records 100000 --sites 10 \
//!              --depth 7 --width 1000 --beta 0.1 [--config cfg.json]
//!
//! `--config` points at a JSON `ProtocolConfig` (the same document the
//! external config loader would supply); omitted fields take defaults.

#![forbid(unsafe_code)]

use std::{env, fs, rc::Rc};

use geomon::{
    make_network, BufferedDataSource, ContinuousQuery, GmVariant, HashFamilyRegistry, Projection,
    ProtocolConfig, Simulation, StreamQuery,
};
use tracing_subscriber::EnvFilter;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn flag_or<T: std::str::FromStr>(args: &[String], key: &str, default: T) -> anyhow::Result<T> {
    match parse_flag(args, key) {
        None => Ok(default),
        Some(s) => s
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value `{s}` for {key}")),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();

    let protocol = parse_flag(&args, "--protocol").unwrap_or_else(|| "SGM".to_string());
    let variant: GmVariant = serde_json::from_value(serde_json::Value::String(
        protocol.to_uppercase(),
    ))
    .map_err(|_| anyhow::anyhow!("unknown protocol `{protocol}` (SGM|AGM|FGM|FRGM|TODS)"))?;

    let records: i32 = flag_or(&args, "--records", 100_000)?;
    let sites: i16 = flag_or(&args, "--sites", 10)?;
    let streams: i16 = flag_or(&args, "--streams", 1)?;
    let keys: i32 = flag_or(&args, "--keys", 10_000)?;
    let depth: usize = flag_or(&args, "--depth", 7)?;
    let width: usize = flag_or(&args, "--width", 1000)?;
    let beta: f64 = flag_or(&args, "--beta", 0.1)?;
    let seed: u64 = flag_or(&args, "--seed", 24534623)?;
    let warmup: usize = flag_or(&args, "--warmup", 0)?;
    let samples: usize = flag_or(&args, "--samples", 100)?;

    let config: ProtocolConfig = match parse_flag(&args, "--config") {
        None => ProtocolConfig::default(),
        Some(path) => {
            let text = fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("read config {path}: {e}"))?;
            serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("parse config {path}: {e}"))?
        }
    };

    let query = match streams {
        1 => StreamQuery::self_join(1, beta),
        2 => StreamQuery::join(1, 2, beta),
        n => anyhow::bail!("unsupported operand count {n} (1 for SELFJOIN, 2 for JOIN)"),
    };

    let run_id = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
    tracing::info!(run_id, protocol, records, sites, "starting simulation");

    // synthetic input, with an optional warmup prefix split off the front
    let mut dataset = geomon::make_uniform_dataset(streams, sites, keys, records, seed);
    let warm = dataset.split_warmup(warmup);
    let mut metadata = dataset.analyze();
    metadata.set_source_range(1, sites);
    metadata.set_stream_range(1, streams);

    let mut sim = Simulation::new(&run_id);
    sim.data_feed(Box::new(BufferedDataSource::with_metadata(dataset, metadata)));
    sim.set_warmup(warm);

    let reg = HashFamilyRegistry::with_seed(seed);
    let proj = Projection::from_registry(&reg, depth, width);
    let site_ids: Vec<i16> = sim.metadata().source_ids().iter().copied().collect();
    let q = Rc::new(ContinuousQuery::new_r(&query, proj, site_ids.len(), config)?);

    let net = make_network(variant, &protocol.to_lowercase(), q, &site_ids)?;
    sim.add_network(net);
    sim.sample_timeseries(samples);

    let world = sim.run();

    use std::io::Write;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for row in &world.timeseries {
        serde_json::to_writer(&mut out, row)?;
        writeln!(out)?;
    }
    for row in &world.results {
        serde_json::to_writer(&mut out, row)?;
        writeln!(out)?;
    }

    Ok(())
}
