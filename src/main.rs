//! `stackctx` records callstacks as an event context and shows the most frequent ones.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use report::Report;
use size::Size;
use stackctx_callstack::{
    ByteOrder, CallstackConfig, CallstackProvider, ContextTable, HostPlatform, Mode, Platform,
};
use tokio::{select, signal::ctrl_c, time::interval};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod report;
mod workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ContextArg {
    Kernel,
    User,
}

impl From<ContextArg> for Mode {
    fn from(arg: ContextArg) -> Self {
        match arg {
            ContextArg::Kernel => Mode::Kernel,
            ContextArg::User => Mode::User,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ByteOrderArg {
    Native,
    Little,
    Big,
}

impl From<ByteOrderArg> for ByteOrder {
    fn from(arg: ByteOrderArg) -> Self {
        match arg {
            ByteOrderArg::Native => ByteOrder::Native,
            ByteOrderArg::Little => ByteOrder::Little,
            ByteOrderArg::Big => ByteOrder::Big,
        }
    }
}

/// `stackctx` attaches callstack contexts to events fired on simulated CPUs.
#[derive(Parser)]
struct Stackctx {
    /// Callstack contexts to record, in record order.
    #[clap(long = "context", short, value_enum, default_value = "user")]
    contexts: Vec<ContextArg>,
    /// Number of simulated CPUs. Defaults to the number of hardware threads.
    #[clap(long, env = "STACKCTX_CPUS")]
    cpus: Option<NonZeroUsize>,
    /// Maximum number of frames per callstack.
    #[clap(long, default_value = "128", env = "STACKCTX_DEPTH")]
    depth: NonZeroUsize,
    /// Append a marker to callstacks that reached the maximum depth.
    #[clap(long, env = "STACKCTX_MARK_TRUNCATED")]
    mark_truncated: bool,
    /// Byte order of the recorded events.
    #[clap(long, value_enum, default_value = "native")]
    byte_order: ByteOrderArg,
    /// Record scripted callstacks instead of walking this process' frame pointers.
    #[clap(long)]
    synthetic: bool,
    /// Top N callstacks to show.
    #[clap(long, default_value = "15")]
    top: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Stackctx { contexts, cpus, depth, mark_truncated, byte_order, synthetic, top } =
        Stackctx::parse();

    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let host = Arc::new(match cpus {
        Some(cpus) => HostPlatform::new(cpus.get()),
        None => HostPlatform::from_available_parallelism(),
    });
    let platform: Arc<dyn Platform> = if synthetic {
        Arc::new(workload::synthetic_platform(host.nr_cpus()))
    } else {
        host.clone()
    };
    let config = CallstackConfig { max_depth: depth, mark_truncated };
    let provider = CallstackProvider::new(platform, config);

    let mut modes: Vec<Mode> = Vec::new();
    for mode in contexts.into_iter().map(Mode::from) {
        if modes.contains(&mode) {
            warn!("Ignoring duplicate {mode} context");
            continue;
        }
        modes.push(mode);
    }

    let mut table = ContextTable::new();
    for &mode in &modes {
        provider
            .add_callstack_context(&mut table, mode)
            .with_context(|| format!("Failed to add {mode} callstack context"))?;
    }
    for field in table.fields() {
        info!("Context field: {}", field.event_field);
    }
    info!(
        "Callstack buffers: {} for {} CPUs",
        Size::from_bytes(table.footprint()),
        host.nr_cpus()
    );

    let byte_order = ByteOrder::from(byte_order);
    let table = Arc::new(table);
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::sync_channel(64 * 1024);
    let workers = (0..host.nr_cpus())
        .map(|cpu| {
            let worker = workload::Worker {
                cpu,
                host: host.clone(),
                table: table.clone(),
                byte_order,
                stop: stop.clone(),
                events: tx.clone(),
            };
            worker.spawn()
        })
        .collect::<Result<Vec<_>>>()?;
    drop(tx);

    info!("Waiting for ^C");
    let mut report = Report::new(modes, byte_order);
    let mut tick = interval(Duration::from_secs(1));
    loop {
        select! {
            _ = ctrl_c() => break,
            _ = tick.tick() => (),
        }

        for record in rx.try_iter() {
            report.add(&record);
        }
        report.print(top);
    }
    info!("Cleaning up...");

    stop.store(true, Ordering::Relaxed);
    let mut lost = 0;
    for worker in workers {
        lost += worker.join().map_err(|_| anyhow::anyhow!("CPU thread panicked"))?;
    }
    if lost > 0 {
        warn!("{lost} events lost while the report was busy");
    }

    Ok(())
}
