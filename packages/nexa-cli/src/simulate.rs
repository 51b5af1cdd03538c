use anyhow::Result;
use clap::Args;
use nexa_devtools::{DevBridge, DevToolsSnapshot};
use nexa_scheduler::runtime::tokio_scheduler;
use nexa_scheduler::{Priority, QueueTaskOptions, TaskStep};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Args)]
pub struct SimulateArgs {
    /// JSON scheduler configuration; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of finite tasks, spread round-robin over the lanes
    #[arg(long, default_value_t = 300)]
    tasks: usize,
    /// Delays cycle through [0, max_delay_ms)
    #[arg(long, default_value_t = 32.0)]
    max_delay_ms: f64,
    /// Every n-th task awaits a timer; 0 disables async tasks
    #[arg(long, default_value_t = 5)]
    async_every: usize,
    /// How long an async task's timer runs
    #[arg(long, default_value_t = 4)]
    async_ms: u64,
    /// Log a snapshot after every flush
    #[arg(long)]
    watch: bool,
    /// Pretty-print the final snapshot
    #[arg(long)]
    pretty: bool,
}

struct LogBridge;

impl DevBridge for LogBridge {
    fn send_snapshot(&self, snapshot: &DevToolsSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => tracing::info!(snapshot = %json, "flush"),
            Err(err) => tracing::warn!(error = %err, "snapshot not serializable"),
        }
    }
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    let config = crate::load_config(args.config.as_deref())?;
    let tracer = nexa_devtools::devtools();
    if args.watch {
        tracer.set_bridge(Box::new(LogBridge));
    }
    let scheduler = tokio_scheduler(config, tracer.clone())?;
    let started = Instant::now();

    // Stand-in for a frame loop; it keeps the render lane ticking until canceled.
    let frames = scheduler.queue_render_task(
        |_| TaskStep::done(),
        QueueTaskOptions::new().persistent(),
    )?;

    let mut results = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let delay = if args.max_delay_ms > 0.0 {
            (i as f64 * 7.0) % args.max_delay_ms
        } else {
            0.0
        };
        let options = QueueTaskOptions::new()
            .priority(Priority::ALL[i % Priority::ALL.len()])
            .delay(delay);
        let task = if args.async_every > 0 && i % args.async_every == 0 {
            let timer = Duration::from_millis(args.async_ms);
            scheduler.queue_task(
                move |_| {
                    TaskStep::future(async move {
                        tokio::time::sleep(timer).await;
                        Ok::<_, anyhow::Error>(i)
                    })
                },
                options,
            )?
        } else {
            scheduler.queue_task(move |_| TaskStep::ready(i), options)?
        };
        results.push(task.result()?);
    }

    let mut finished = 0usize;
    for result in results {
        result.await?;
        finished += 1;
    }
    scheduler.yield_all(1).await;
    frames.cancel()?;

    tracing::info!(
        tasks = finished,
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "simulation finished"
    );

    let snapshot = tracer.snapshot();
    let json = if args.pretty {
        serde_json::to_string_pretty(&snapshot)?
    } else {
        serde_json::to_string(&snapshot)?
    };
    println!("{json}");
    Ok(())
}
