use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use psi_hashing::hasher::seed_from_hex;
use psi_hashing::{
    build_table_with_hasher, generate_seeds, BuildReport, Element, HashingConfig, Seed,
    SeededHasher, Sha3Seeded, TableReader, Xxh3Seeded,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "psi-hashing")]
#[command(about = "Multi-hash bucketed table builder for private set intersection inputs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HasherKind {
    Xxh3,
    Sha3,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition a source file and build the table
    Build {
        /// Flat file of 16-byte elements
        #[arg(long)]
        source: PathBuf,
        /// Directory for bucket files, shards and the manifest
        #[arg(long)]
        bucket_dir: PathBuf,
        #[arg(long, default_value_t = 1024)]
        buckets: usize,
        /// Hash function seed as 32 hex digits; repeat once per function
        #[arg(long = "seed")]
        seeds: Vec<String>,
        /// Number of hash functions when seeds are generated
        #[arg(long, default_value_t = 3)]
        hashes: usize,
        /// RNG seed for generated hash seeds
        #[arg(long, default_value_t = 0)]
        rng_seed: u64,
        #[arg(long, default_value_t = 4096)]
        queue_capacity: usize,
        /// Elements per source read
        #[arg(long, default_value_t = 1 << 16)]
        chunk: usize,
        /// Partition workers; defaults to available parallelism
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long, default_value_t = 1.0)]
        table_factor: f64,
        /// Expected cardinality is 10^exponent
        #[arg(long, default_value_t = 6)]
        exponent: u32,
        /// Index of the first result<N> shard
        #[arg(long, default_value_t = 0)]
        shard_base: u32,
        #[arg(long)]
        buckets_per_shard: Option<usize>,
        /// Producer wait on a flushing bucket; 0 waits forever
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
        #[arg(long, value_enum, default_value_t = HasherKind::Xxh3)]
        hasher: HasherKind,
    },
    /// Look an element up in a built table
    Probe {
        /// Directory holding the manifest and shards
        #[arg(long)]
        dir: PathBuf,
        /// Element as 32 hex digits
        #[arg(long)]
        element: String,
        #[arg(long, value_enum, default_value_t = HasherKind::Xxh3)]
        hasher: HasherKind,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Commands::Build {
            source,
            bucket_dir,
            buckets,
            seeds,
            hashes,
            rng_seed,
            queue_capacity,
            chunk,
            threads,
            table_factor,
            exponent,
            shard_base,
            buckets_per_shard,
            timeout_secs,
            hasher,
        } => {
            let seeds = if seeds.is_empty() {
                generate_seeds(hashes, rng_seed)
            } else {
                seeds
                    .iter()
                    .map(|s| parse_seed(s))
                    .collect::<Result<Vec<Seed>>>()?
            };
            let mut config = HashingConfig::new(source, bucket_dir, seeds)
                .with_bucket_count(buckets)
                .with_queue_capacity(queue_capacity)
                .with_read_chunk_size(chunk)
                .with_table_size_factor(table_factor)
                .with_dataset_size_exponent(exponent)
                .with_shard_base_index(shard_base)
                .with_buckets_per_shard(buckets_per_shard)
                .with_backpressure_timeout(
                    (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
                );
            if let Some(threads) = threads {
                config = config.with_worker_count(threads);
            }

            let report = match hasher {
                HasherKind::Xxh3 => build_table_with_hasher::<Xxh3Seeded>(&config),
                HasherKind::Sha3 => build_table_with_hasher::<Sha3Seeded>(&config),
            }
            .context("table build failed")?;
            print_report(&report);
        }
        Commands::Probe {
            dir,
            element,
            hasher,
        } => {
            let table = TableReader::open_dir(&dir)
                .with_context(|| format!("cannot open table in {}", dir.display()))?;
            let element = parse_element(&element)?;
            match hasher {
                HasherKind::Xxh3 => probe::<Xxh3Seeded>(&table, &element)?,
                HasherKind::Sha3 => probe::<Sha3Seeded>(&table, &element)?,
            }
        }
    }
    Ok(())
}

fn parse_seed(s: &str) -> Result<Seed> {
    seed_from_hex(s).ok_or_else(|| anyhow!("seed {s:?} is not 32 hex digits"))
}

fn parse_element(s: &str) -> Result<Element> {
    match seed_from_hex(s) {
        Some(bytes) => Ok(bytes),
        None => bail!("element {s:?} is not 32 hex digits"),
    }
}

fn print_report(report: &BuildReport) {
    let p = &report.partition;
    let t = &report.table;
    info!(
        "Pass 1: {} elements, {} records, {} spills, {} failed writes",
        p.elements_read, p.buffers.records_enqueued, p.buffers.flushes, p.buffers.write_failures
    );
    info!(
        "Pass 2: {} buckets, {} skipped, {} chains, {} sentinels, {} misplaced",
        t.buckets_processed,
        t.buckets_skipped,
        t.chains_written,
        t.sentinels_written,
        t.placement_mismatches
    );
    for shard in &t.shards {
        info!(
            "  {}: buckets {}.., {} records",
            shard.file_name, shard.first_bucket, shard.records
        );
    }
    println!("{}", report.manifest_path.display());
}

fn probe<H: SeededHasher>(table: &TableReader, element: &Element) -> Result<()> {
    let hits = table.probe::<H>(element)?;
    for hit in &hits {
        println!(
            "seed {:>3}  bucket {:>6}  position {:>12}  slot {:>6}  chain {:>3}  {}",
            hit.seed_index,
            hit.bucket,
            hit.position,
            hit.local_index,
            hit.chain.len(),
            if hit.found { "found" } else { "-" }
        );
    }
    if !hits.iter().any(|h| h.found) {
        bail!("element not in table");
    }
    Ok(())
}
