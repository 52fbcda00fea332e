use leakwatch::{Config, DebugHeap, Detector};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;

#[global_allocator]
static HEAP: DebugHeap = DebugHeap::new();

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    init_log()?;

    let detector = Detector::builder()
        .config(Config::from_env().with_max_trace_frames(32))
        .heap(&HEAP)
        .attach();
    tracing::info!(
        "Starting the application... Allocated {} bytes",
        HEAP.allocated()
    );

    let handles: Vec<_> = (0..4)
        .map(|worker| tokio::spawn(async move { work(worker) }))
        .collect();
    for handle in handles {
        handle.await?;
    }
    tracing::info!(leaks = detector.leak_count(), "workers done");

    // Log completion
    let summary = detector.detach();
    tracing::info!(
        "Application finished. Allocated {} bytes, {} leaks",
        HEAP.allocated(),
        summary.leaks
    );

    Ok(())
}

fn work(worker: usize) {
    let scratch = vec![worker as u8; 128];
    tracing::debug!(worker, len = scratch.len(), "scratch buffer");
    if worker == 2 {
        // never freed
        let _ = Box::leak(format!("worker {worker} leaked this").into_boxed_str());
    }
}

fn init_log() -> Result<(), Box<dyn std::error::Error>> {
    let stdout_logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    let registry = tracing_subscriber::registry()
        .with(stdout_logger.with_filter(LevelFilter::from(Level::TRACE)));

    tracing::subscriber::set_global_default(registry)?;

    Ok(())
}
