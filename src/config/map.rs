use crate::MemSampler;
use clap::Parser;
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum OpsPerCs {
    One,
    Four,
}

impl fmt::Display for OpsPerCs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsPerCs::One => write!(f, "1"),
            OpsPerCs::Four => write!(f, "4"),
        }
    }
}

fn parse_ops_per_cs(arg: &str) -> Result<OpsPerCs, String> {
    match arg {
        "1" => Ok(OpsPerCs::One),
        "4" => Ok(OpsPerCs::Four),
        _ => Err(format!("expected 1 or 4, got `{arg}`")),
    }
}

#[derive(PartialEq, Debug)]
pub enum Op {
    Get,
    Insert,
    Remove,
}

impl Op {
    pub const OPS: [Op; 3] = [Op::Get, Op::Insert, Op::Remove];
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum GetRate {
    WriteOnly = 0,
    ReadWrite = 1,
    ReadIntensive = 2,
    ReadOnly = 3,
}

impl GetRate {
    fn from_level(level: u8) -> Self {
        match level {
            0 => GetRate::WriteOnly,
            1 => GetRate::ReadWrite,
            2 => GetRate::ReadIntensive,
            _ => GetRate::ReadOnly,
        }
    }

    /// Weights of [`Op::OPS`].
    fn op_weights(self) -> [i32; 3] {
        match self {
            GetRate::WriteOnly => [0, 1, 1],
            GetRate::ReadWrite => [2, 1, 1],
            GetRate::ReadIntensive => [18, 1, 1],
            GetRate::ReadOnly => [1, 0, 0],
        }
    }
}

/// Throughput and memory benchmark of the epoch-protected hash map.
#[derive(Parser, Debug)]
#[command(name = "ebr")]
pub struct Args {
    /// Number of worker threads
    #[arg(short = 't')]
    pub threads: usize,

    /// The degree of non-cooperation. The auxiliary thread stays in a critical region and
    /// leaves it every 1: 1ms, 2: 10ms, 3: never (stall)
    #[arg(short = 'n', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..4))]
    pub non_coop: u8,

    /// The proportion of `get` (read) operations. 0: 0%, 1: 50%, 2: 90%, 3: 100%
    #[arg(short = 'g', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..4))]
    pub get_rate: u8,

    /// Key range: [0..RANGE]
    #[arg(short = 'r', default_value_t = 100000)]
    pub range: usize,

    /// Time interval in seconds to run the benchmark
    #[arg(short = 'i', default_value_t = 10)]
    pub interval: u64,

    /// The period to query jemalloc stats.allocated (ms). 0 for no sampling. Only supported on
    /// linux.
    #[arg(short = 's', default_value_t = 1)]
    pub sampling_period: u64,

    /// Operations per each critical section (1 or 4)
    #[arg(short = 'c', default_value = "1", value_parser = parse_ops_per_cs)]
    pub ops_per_cs: OpsPerCs,

    /// Pending bytes above which workers start cleaning up
    #[arg(short = 'b', default_value_t = 65536)]
    pub memory_budget: usize,

    /// Output CSV filename. Appends the data if the file already exists.
    #[arg(short = 'o')]
    pub output: Option<PathBuf>,

    /// Check whether the arguments are parsable, without running a benchmark
    #[arg(long)]
    pub dry_run: bool,
}

pub struct Config {
    pub threads: usize,
    /// Pending bytes above which workers start cleaning up.
    pub memory_budget: usize,

    pub aux_thread: usize,
    pub aux_thread_period: Duration,
    pub non_coop: u8,
    pub non_coop_period: Duration,
    pub sampling: bool,
    pub sampling_period: Duration,

    pub get_rate: GetRate,
    pub op_dist: WeightedIndex<i32>,
    pub key_dist: Uniform<usize>,
    pub prefill: usize,
    pub key_range: usize,
    pub interval: u64,
    pub duration: Duration,
    pub ops_per_cs: OpsPerCs,

    pub mem_sampler: MemSampler,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        let get_rate = GetRate::from_level(args.get_rate);
        let sampling = args.sampling_period > 0
            && cfg!(all(not(feature = "sanitize"), target_os = "linux"));
        // Every weight table has a positive entry.
        let op_dist = WeightedIndex::new(get_rate.op_weights()).unwrap();

        Config {
            threads: args.threads,
            memory_budget: args.memory_budget,

            aux_thread: if sampling || args.non_coop > 0 { 1 } else { 0 },
            aux_thread_period: Duration::from_millis(1),
            non_coop: args.non_coop,
            non_coop_period: match args.non_coop {
                1 => Duration::from_millis(1),
                2 => Duration::from_millis(10),
                // Never leaves the region if -n0 or -n3
                _ => Duration::from_secs(args.interval),
            },
            sampling,
            sampling_period: Duration::from_millis(args.sampling_period),

            get_rate,
            op_dist,
            key_dist: Uniform::from(0..args.range),
            prefill: args.range / 2,
            key_range: args.range,
            interval: args.interval,
            duration: Duration::from_secs(args.interval),
            ops_per_cs: args.ops_per_cs,

            mem_sampler: MemSampler::new(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hash map: {} threads, n{}, c{}, g{}, budget {}",
            self.threads,
            self.non_coop,
            self.ops_per_cs,
            self.get_rate as u8,
            readable_bytes(self.memory_budget),
        )
    }
}

pub struct BenchWriter {
    output: Option<Writer<File>>,
}

#[derive(Clone)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    /// Objects queued for deletion but not reclaimed yet.
    pub peak_garb: usize,
    pub avg_garb: usize,
    pub peak_garb_bytes: usize,
    pub epoch_advances: u64,
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops/s: {}, peak mem: {}, avg_mem: {}, peak garb: {} ({}), avg garb: {}, epochs: {}",
            self.ops_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
            self.peak_garb,
            readable_bytes(self.peak_garb_bytes),
            self.avg_garb,
            self.epoch_advances,
        )
    }
}

fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut scaled = num as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if scaled < 1000.0 {
            return format!("{scaled:.3} {unit}");
        }
        scaled /= 1024.0;
    }
    format!("{scaled:.3} {}", UNITS[UNITS.len() - 1])
}

const CSV_HEADER: [&str; 15] = [
    "threads",
    "memory_budget",
    "sampling_period",
    "non_coop",
    "get_rate",
    "ops_per_cs",
    "throughput",
    "peak_mem",
    "avg_mem",
    "peak_garb",
    "avg_garb",
    "peak_garb_bytes",
    "epoch_advances",
    "key_range",
    "interval",
];

fn csv_record(config: &Config, perf: &Perf) -> [String; CSV_HEADER.len()] {
    [
        config.threads.to_string(),
        config.memory_budget.to_string(),
        config.sampling_period.as_millis().to_string(),
        config.non_coop.to_string(),
        (config.get_rate as u8).to_string(),
        config.ops_per_cs.to_string(),
        perf.ops_per_sec.to_string(),
        perf.peak_mem.to_string(),
        perf.avg_mem.to_string(),
        perf.peak_garb.to_string(),
        perf.avg_garb.to_string(),
        perf.peak_garb_bytes.to_string(),
        perf.epoch_advances.to_string(),
        config.key_range.to_string(),
        config.interval.to_string(),
    ]
}

impl BenchWriter {
    pub fn write_record(self, config: &Config, perf: &Perf) {
        if let Some(mut output) = self.output {
            output.write_record(csv_record(config, perf)).unwrap();
            output.flush().unwrap();
        }
    }
}

/// Opens `path` for appending, writing the header first if the file is new.
fn open_output(path: &Path) -> Writer<File> {
    if let Some(dir) = path.parent() {
        create_dir_all(dir).unwrap();
    }
    match OpenOptions::new().read(true).append(true).open(path) {
        Ok(f) => csv::Writer::from_writer(f),
        Err(_) => {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .unwrap();
            let mut output = csv::Writer::from_writer(f);
            // NOTE: `write_record` on `bench`
            output.write_record(CSV_HEADER).unwrap();
            output.flush().unwrap();
            output
        }
    }
}

pub fn setup() -> (Config, BenchWriter) {
    let args = Args::parse();
    let config = Config::from_args(&args);

    if args.dry_run {
        std::process::exit(0);
    }

    let output = args.output.as_deref().map(open_output);
    (config, BenchWriter { output })
}
