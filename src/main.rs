use std::time::{Duration, Instant};

use candle_core::DType;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use nano_serve::{
    Engine, EngineConfig, KvCacheLayout, SamplingConfig, SchedulerStats, StreamEvent,
    SyntheticKernel,
};

#[derive(Parser, Debug)]
#[command(name = "nano-serve")]
#[command(about = "Offline workload simulation for the nano-serve scheduler")]
struct Args {
    /// Engine configuration file (JSON); flags below override it
    #[arg(short, long)]
    config: Option<String>,

    /// Number of requests to submit
    #[arg(short = 'n', long, default_value = "64")]
    requests: usize,

    /// Shortest prompt, in tokens
    #[arg(long, default_value = "8")]
    min_prompt_len: usize,

    /// Longest prompt, in tokens
    #[arg(long, default_value = "256")]
    max_prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "64")]
    max_tokens: usize,

    /// Rows per batch
    #[arg(long)]
    batch_width: Option<usize>,

    /// Tokens per KV cache page
    #[arg(long)]
    page_size: Option<usize>,

    /// Pages in the KV cache pool
    #[arg(long)]
    num_pages: Option<usize>,

    /// Size the pool from a KV cache budget in MiB instead of --num-pages
    #[arg(long)]
    kv_budget_mib: Option<usize>,

    /// Layers of the simulated model (for --kv-budget-mib)
    #[arg(long, default_value = "28")]
    num_layers: usize,

    /// KV heads of the simulated model (for --kv-budget-mib)
    #[arg(long, default_value = "8")]
    num_kv_heads: usize,

    /// Head dimension of the simulated model (for --kv-budget-mib)
    #[arg(long, default_value = "128")]
    head_dim: usize,

    /// Longest prefill chunk per step
    #[arg(long)]
    max_prefill_chunk: Option<usize>,

    /// Share of batch rows favored for prefill
    #[arg(long)]
    prefill_fraction: Option<f32>,

    /// Vocabulary size of the synthetic kernel
    #[arg(long, default_value = "32000")]
    vocab_size: usize,

    /// Simulated forward-pass latency in microseconds
    #[arg(long, default_value = "0")]
    step_latency_us: u64,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value = "0.0")]
    temperature: f32,

    /// Workload seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Serialize)]
struct Summary {
    requests: usize,
    input_tokens: usize,
    output_tokens: usize,
    completed: usize,
    aborted: usize,
    elapsed_secs: f64,
    output_throughput: f64,
    total_throughput: f64,
    stats: SchedulerStats,
}

fn build_config(args: &Args) -> nano_serve::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(width) = args.batch_width {
        config.scheduler.batch_width = width;
    }
    if let Some(chunk) = args.max_prefill_chunk {
        config.scheduler.max_prefill_chunk = chunk;
    }
    if let Some(fraction) = args.prefill_fraction {
        config.scheduler.prefill_fraction = fraction;
    }
    if let Some(page_size) = args.page_size {
        config.cache.page_size = page_size;
    }
    if let Some(num_pages) = args.num_pages {
        config.cache.num_pages = num_pages;
    }
    if let Some(mib) = args.kv_budget_mib {
        let layout = KvCacheLayout::new(args.num_layers, args.num_kv_heads, args.head_dim, DType::BF16);
        config.cache = config.cache.with_memory_budget(&layout, mib * 1024 * 1024);
    }
    config.validate()?;
    Ok(config)
}

fn main() -> nano_serve::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(if args.debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&args)?;
    info!(
        batch_width = config.scheduler.batch_width,
        page_size = config.cache.page_size,
        num_pages = config.cache.num_pages,
        "starting nano-serve v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut kernel = SyntheticKernel::new(args.vocab_size);
    if args.step_latency_us > 0 {
        kernel = kernel.with_latency(Duration::from_micros(args.step_latency_us));
    }
    let (handle, join) = Engine::spawn(&config, kernel)?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let min_len = args.min_prompt_len.max(1);
    let max_len = args.max_prompt_len.max(min_len);

    let start = Instant::now();
    let mut streams = Vec::with_capacity(args.requests);
    let mut input_tokens = 0;
    for i in 0..args.requests {
        let len = rng.gen_range(min_len..=max_len);
        let prompt: Vec<u32> = (0..len)
            .map(|_| rng.gen_range(0..args.vocab_size as u32))
            .collect();
        input_tokens += prompt.len();
        let sampling = SamplingConfig {
            temperature: args.temperature,
            max_tokens: args.max_tokens,
            seed: Some(args.seed.wrapping_add(i as u64)),
            ..SamplingConfig::default()
        };
        let (_, stream) = handle.submit(prompt, sampling)?;
        streams.push(stream);
    }

    let mut output_tokens = 0;
    let mut completed = 0;
    let mut aborted = 0;
    for stream in streams {
        let (tokens, terminal) = stream.collect_all();
        output_tokens += tokens.len();
        match terminal {
            Some(StreamEvent::Completed(_)) => completed += 1,
            _ => aborted += 1,
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    handle.shutdown()?;
    drop(handle);
    let stats = join
        .join()
        .map_err(|_| std::io::Error::other("scheduler thread panicked"))??;

    let summary = Summary {
        requests: args.requests,
        input_tokens,
        output_tokens,
        completed,
        aborted,
        elapsed_secs: elapsed,
        output_throughput: output_tokens as f64 / elapsed.max(f64::EPSILON),
        total_throughput: (input_tokens + output_tokens) as f64 / elapsed.max(f64::EPSILON),
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
