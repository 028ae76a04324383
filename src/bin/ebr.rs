use crossbeam_utils::thread::scope;
use rand::prelude::*;
use std::cmp::max;
use std::io::{stdout, Write};
use std::sync::{mpsc, Arc, Barrier};
use std::thread::available_parallelism;
use std::time::Instant;
use tracing_subscriber::filter::EnvFilter;
use typenum::{Unsigned, U1, U4};

use ebr_benchmark::config::map::{setup, BenchWriter, Config, Op, OpsPerCs, Perf};
use ebr_benchmark::ds_impl::ebr::{ConcurrentMap, HashMap};
use ebr_rs::{Collector, Config as CollectorConfig, CriticalRegionHolder};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let (config, output) = setup();
    match config.ops_per_cs {
        OpsPerCs::One => bench::<U1>(&config, output),
        OpsPerCs::Four => bench::<U4>(&config, output),
    }
}

fn bench<N: Unsigned>(config: &Config, output: BenchWriter) {
    println!("{}", config);
    let perf = bench_map::<HashMap<usize, usize>, N>(config);
    output.write_record(config, &perf);
    println!("{}", perf);
}

/// Inserts random keys with multiple threads.
fn prefill<M: ConcurrentMap<usize, usize> + Send + Sync>(
    config: &Config,
    collector: &Collector,
    map: &M,
) {
    let threads = available_parallelism().map(|v| v.get()).unwrap_or(1);
    print!("prefilling with {threads} threads... ");
    stdout().flush().unwrap();
    scope(|s| {
        for t in 0..threads {
            s.spawn(move |_| {
                let rng = &mut rand::thread_rng();
                let count =
                    config.prefill / threads + if t < config.prefill % threads { 1 } else { 0 };
                for _ in 0..count {
                    let key = config.key_dist.sample(rng);
                    let value = key;
                    map.insert(key, value, &collector.enter().unwrap());
                }
                collector.thread_detach();
            });
        }
    })
    .unwrap();
    // Reclaims the tables outgrown while prefilling.
    while collector.pending_count() > 0 {
        collector.clean_up_pending();
    }
    print!("prefilled... ");
    stdout().flush().unwrap();
}

fn bench_map<M: ConcurrentMap<usize, usize> + Send + Sync, N: Unsigned>(config: &Config) -> Perf {
    let collector = &Collector::with_config(
        CollectorConfig::default()
            .memory_budget_bytes(config.memory_budget)
            .drain_on_drop(true),
    );
    let map = &M::new(collector);
    prefill(config, collector, map);
    let advances_before = collector.stats().epoch_advances;

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    scope(|s| {
        // sampling & interference thread
        if config.aux_thread > 0 {
            let mem_sender = mem_sender.clone();
            s.spawn(move |_| {
                let mut samples = 0usize;
                let mut acc = 0usize;
                let mut peak = 0usize;
                let mut garb_acc = 0usize;
                let mut garb_peak = 0usize;
                let mut garb_bytes_peak = 0usize;
                barrier.clone().wait();

                let start = Instant::now();
                // Stays inside a region only if non-cooperative, leaving it periodically.
                let mut guard = CriticalRegionHolder::new(collector, config.non_coop > 0).unwrap();
                let mut next_sampling = start + config.sampling_period;
                let mut next_repin = start + config.non_coop_period;
                while start.elapsed() < config.duration {
                    let now = Instant::now();
                    if now > next_sampling {
                        let allocated = config.mem_sampler.sample();
                        samples += 1;

                        acc += allocated;
                        peak = max(peak, allocated);

                        let stats = collector.stats();
                        garb_acc += stats.pending_entries;
                        garb_peak = max(garb_peak, stats.pending_entries);
                        garb_bytes_peak = max(garb_bytes_peak, stats.pending_bytes);

                        next_sampling = now + config.sampling_period;
                    }
                    if now > next_repin {
                        guard.exit_during(|| {});
                        next_repin = now + config.non_coop_period;
                    }
                    std::thread::sleep(config.aux_thread_period);
                }
                drop(guard);

                if config.sampling && samples > 0 {
                    mem_sender
                        .send((peak, acc / samples, garb_peak, garb_acc / samples, garb_bytes_peak))
                        .unwrap();
                } else {
                    mem_sender.send((0, 0, 0, 0, 0)).unwrap();
                }
            });
        } else {
            mem_sender.send((0, 0, 0, 0, 0)).unwrap();
        }

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let mut rng = &mut rand::thread_rng();
                barrier.clone().wait();
                let start = Instant::now();

                let mut guard = collector.enter().unwrap();
                while start.elapsed() < config.duration {
                    let key = config.key_dist.sample(rng);
                    match Op::OPS[config.op_dist.sample(&mut rng)] {
                        Op::Get => {
                            map.get(&key, &guard);
                        }
                        Op::Insert => {
                            let value = key;
                            map.insert(key, value, &guard);
                        }
                        Op::Remove => {
                            map.remove(&key, &guard);
                        }
                    }
                    ops += 1;
                    if ops % N::to_u64() == 0 {
                        drop(guard);
                        if collector.clean_up_requested() {
                            collector.clean_up_pending();
                        }
                        guard = collector.enter().unwrap();
                    }
                }
                drop(guard);
                collector.thread_detach();

                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let mut ops = 0;
    for _ in 0..config.threads {
        let local_ops = ops_receiver.recv().unwrap();
        ops += local_ops;
    }
    let ops_per_sec = ops / config.interval;
    let (peak_mem, avg_mem, peak_garb, avg_garb, peak_garb_bytes) = mem_receiver.recv().unwrap();
    Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
        peak_garb,
        avg_garb,
        peak_garb_bytes,
        epoch_advances: collector.stats().epoch_advances - advances_before,
    }
}
