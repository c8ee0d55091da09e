//! microbatch CLI - drive the scheduler with synthetic traffic.
//!
//! ## Usage
//!
//! ```bash
//! # 200 requests through 2 runners, batches up to 8
//! microbatch --requests 200 --runners 2 --max-batch-size 8
//!
//! # Preferred sizes and a 2ms queue delay
//! microbatch -n 500 --preferred 4 --preferred 8 --queue-delay-us 2000
//!
//! # Ordered responses across 4 runners
//! microbatch -n 500 --runners 4 --preserve-ordering
//! ```

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use clap::Parser;
use rand::Rng;
use tracing::info;

use microbatch::{
    BatcherConfig, ClosureExecutor, DType, DynamicBatchScheduler, InferenceRequest, InputSpec,
    InputTensor, ModelSchema, OutputTensor, QueuePolicy, ResponseSender, TensorData,
};

/// microbatch: a dynamic request-batching scheduler
#[derive(Parser, Debug)]
#[command(name = "microbatch")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of synthetic requests to enqueue
    #[arg(short = 'n', long, default_value = "200")]
    requests: usize,

    /// Number of runner threads
    #[arg(long, default_value = "2")]
    runners: usize,

    /// Maximum effective batch size
    #[arg(long, default_value = "8")]
    max_batch_size: usize,

    /// Preferred batch size(s) - can be specified multiple times
    #[arg(long = "preferred")]
    preferred: Vec<usize>,

    /// Maximum queue delay in microseconds
    #[arg(long, default_value = "1000")]
    queue_delay_us: u64,

    /// Emit responses in enqueue order across runners
    #[arg(long)]
    preserve_ordering: bool,

    /// Number of priority levels (0 = single queue)
    #[arg(long, default_value = "0")]
    priority_levels: u32,

    /// Per-request timeout in microseconds (0 = none)
    #[arg(long, default_value = "0")]
    timeout_us: u64,

    /// Elements per request payload
    #[arg(long, default_value = "16")]
    elements: usize,

    /// Maximum random jitter between arrivals, in microseconds
    #[arg(long, default_value = "100")]
    arrival_jitter_us: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let schema = ModelSchema::new(args.max_batch_size.max(1))
        .with_input(InputSpec::new("INPUT0", DType::Fp32, vec![args.elements as i64]));

    let config = BatcherConfig {
        runner_count: args.runners,
        max_batch_size: args.max_batch_size,
        preferred_batch_sizes: args.preferred.clone(),
        max_queue_delay_us: args.queue_delay_us,
        preserve_ordering: args.preserve_ordering,
        priority_levels: args.priority_levels,
        default_queue_policy: QueuePolicy {
            default_timeout_us: args.timeout_us,
            ..Default::default()
        },
        ..Default::default()
    };

    // Pass-through executor: echoes INPUT0 as OUTPUT0 and records the
    // batch sizes it saw.
    let histogram = Arc::new(std::sync::Mutex::new(BTreeMap::<usize, usize>::new()));
    let executor = {
        let histogram = Arc::clone(&histogram);
        ClosureExecutor::new(move |batch: &microbatch::Batch| {
            let size = batch.effective_batch_size();
            *histogram
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entry(size)
                .or_insert(0) += 1;
            let input = batch
                .input("INPUT0")
                .ok_or_else(|| microbatch::Error::Executor("INPUT0 missing".into()))?;
            Ok(microbatch::BatchOutput::Batched(vec![OutputTensor::new(
                "OUTPUT0",
                input.dtype,
                input.shape.clone(),
                TensorData::new(input.data.as_slice().to_vec(), input.data.kind()),
            )]))
        })
    };

    info!(
        requests = args.requests,
        runners = args.runners,
        max_batch_size = args.max_batch_size,
        "starting scheduler"
    );
    let scheduler = DynamicBatchScheduler::build(schema, config, Arc::new(executor))?;

    let (done_tx, done_rx) = mpsc::channel::<bool>();
    let mut rng = rand::thread_rng();
    let payload_bytes = args.elements * 4;
    let started = Instant::now();

    for i in 0..args.requests {
        let done_tx = done_tx.clone();
        let sink = ResponseSender::new(move |result| {
            let _ = done_tx.send(result.is_ok());
        });
        let payload: Vec<u8> = (0..payload_bytes).map(|_| rng.gen()).collect();
        let input = InputTensor::new(
            "INPUT0",
            DType::Fp32,
            vec![1, args.elements as i64],
            TensorData::host(payload),
        );
        let request =
            InferenceRequest::new(format!("demo-{i}"), vec![input], Vec::new(), sink);
        scheduler.enqueue(request);

        if args.arrival_jitter_us > 0 {
            std::thread::sleep(Duration::from_micros(
                rng.gen_range(0..=args.arrival_jitter_us),
            ));
        }
    }
    drop(done_tx);

    let mut ok = 0usize;
    let mut failed = 0usize;
    for _ in 0..args.requests {
        match done_rx.recv() {
            Ok(true) => ok += 1,
            Ok(false) => failed += 1,
            Err(_) => break,
        }
    }
    let elapsed = started.elapsed();
    drop(scheduler);

    println!("═══════════════════════════════════════════════════════════════");
    println!("                        SUMMARY                                ");
    println!("═══════════════════════════════════════════════════════════════");
    println!("  Requests:   {} ok, {} failed", ok, failed);
    println!("  Time:       {:.2?}", elapsed);
    println!(
        "  Throughput: {:.0} requests/sec",
        ok as f64 / elapsed.as_secs_f64()
    );
    println!("  Batch size histogram:");
    let histogram = histogram
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for (size, count) in histogram.iter() {
        println!("    {:>3} x {}", size, count);
    }
    println!("═══════════════════════════════════════════════════════════════");

    Ok(())
}
