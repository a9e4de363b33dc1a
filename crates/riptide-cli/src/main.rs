//! CLI binary with runnable Riptide pipeline demos.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use riptide_pipeline::{Queue, Resolver, Task};
use riptide_types::TaskError;

#[derive(Parser)]
#[command(name = "riptide", version, about = "Lazy effect pipelines: queue fan-out and retry demos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fan messages out from a shared queue to parallel consumers
    Feed {
        /// Number of messages to produce
        #[arg(short, long, default_value = "12")]
        messages: usize,

        /// Number of consumers sharing the queue
        #[arg(short, long, default_value = "3")]
        consumers: usize,

        /// Milliseconds between messages
        #[arg(short, long, default_value = "200")]
        interval_ms: u64,
    },

    /// Fetch a batch of simulated flaky pages with a deadline and retry
    Scrape {
        /// Number of pages to fetch
        #[arg(short, long, default_value = "20")]
        count: usize,

        /// Per-attempt deadline in milliseconds
        #[arg(short, long, default_value = "50")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Feed { messages, consumers, interval_ms } => {
            cmd_feed(messages, consumers, interval_ms).await?;
        }
        Commands::Scrape { count, timeout_ms } => {
            cmd_scrape(count, timeout_ms).await?;
        }
    }

    Ok(())
}

/// One producer pushes paced messages into a queue while consumers drain it
/// round-robin; every party is a pipeline field of one parallel aggregate,
/// and the queue reaches them through the environment.
async fn cmd_feed(messages: usize, consumers: usize, interval_ms: u64) -> anyhow::Result<()> {
    let queue: Queue<String> = Queue::new();

    let producer = Task::unit().access::<Queue<String>>().chain(move |queue| {
        Task::from_callback(move |resolver: Resolver<Vec<String>>| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                let mut sent = Vec::with_capacity(messages);
                for n in 0..messages {
                    ticker.tick().await;
                    let message = format!("message {n}");
                    queue.add(message.clone());
                    sent.push(message);
                }
                queue.clear();
                tracing::debug!(sent = sent.len(), "producer done, queue cleared");
                resolver.resolve(sent);
            });
        })
    });

    let mut fields = vec![("producer".to_string(), producer)];
    for id in 0..consumers {
        let consumer = Task::unit().access::<Queue<String>>().chain(move |queue| {
            Task::sequence_from_stream(queue.iterate())
                .tap(move |message: &String| println!("consumer {id} <- {message}"))
                .collect_all()
        });
        fields.push((format!("consumer-{id}"), consumer));
    }

    let report = Task::struct_par(fields)
        .provide(queue)
        .run()
        .await
        .map_err(|error| anyhow::anyhow!("feed pipeline failed: {error}"))?;

    for (name, handled) in &report {
        println!("{name}: {} message(s)", handled.len());
    }
    Ok(())
}

/// Fetches every page of a batch through one pipeline: a per-attempt
/// deadline, a simulated flaky transport, and an unconditional retry. Odd
/// request ids fail, every tenth is slow enough to trip the deadline, so
/// each page lands after a couple of attempts.
async fn cmd_scrape(count: usize, timeout_ms: u64) -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let urls: Vec<String> = (0..count).map(|n| format!("https://site-{n}.example/page")).collect();

    let probe = Arc::clone(&calls);
    let pages = Task::sequence_from_iter(urls)
        .timeout(Duration::from_millis(timeout_ms))
        .try_map_async(move |url| fetch_page(Arc::clone(&probe), url))
        .map_error(|error: TaskError| {
            tracing::warn!(%error, "fetch failed, will retry");
            error.to_string()
        })
        .retry_while(|| true)
        .collect_all()
        .run()
        .await
        .map_err(|error| anyhow::anyhow!("scrape failed: {error}"))?;

    println!(
        "fetched {} page(s) with {} request(s) issued",
        pages.len(),
        calls.load(Ordering::SeqCst)
    );
    for page in &pages {
        println!("  {page}");
    }
    Ok(())
}

async fn fetch_page(calls: Arc<AtomicUsize>, url: String) -> Result<String, String> {
    let id = calls.fetch_add(1, Ordering::SeqCst) + 1;
    let wait = if id % 10 == 0 { 1000 } else { 10 };
    tokio::time::sleep(Duration::from_millis(wait)).await;
    if id % 2 != 0 {
        Err(format!("500 - {url}"))
    } else {
        Ok(format!("<html>#{id} hello from {url}</html>"))
    }
}
