//! `cpuctl`: CLI entry point. Attaches to the dataplane's `/ix` shared
//! memory segment and either performs a one-shot operation or runs the
//! closed-loop controller under `--control`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cpuctl::topology::TopologySource;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cpuctl::background::{BackgroundJob, RealBackgroundControl};
use cpuctl::cli::Opts;
use cpuctl::command::{BusyWaitExecutor, RealFifoDir};
use cpuctl::config::Config;
use cpuctl::controller::{ControllerLoop, SysfsFrequencyControl, SystemClock};
use cpuctl::ops;
use cpuctl::shmem::MappedShmem;
use cpuctl::steps::build_step_table;
use cpuctl::topology::SysfsTopologySource;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cpuctl=debug")))
        .init();

    let opts = Opts::parse();
    let config = Config::from_env();

    tracing::info!(shm_name = %config.shm_name, "attaching to shared memory");
    let mut shmem = MappedShmem::attach(&config.shm_name)
        .with_context(|| format!("attaching to {}", config.shm_name))?;
    let mut view = shmem.view();

    let fifos = RealFifoDir { dir: config.fifo_dir.clone() };
    let executor = BusyWaitExecutor;
    let topology = SysfsTopologySource::new(config.sysfs_root.clone());

    let background_job = match opts.background_cpus()? {
        Some(cpus) => Some(BackgroundJob {
            fifo: opts.background_fifo.clone().map(Into::into),
            pid: opts.background_pid,
            cpus,
        }),
        None => None,
    };

    if opts.single_cpu {
        ops::collapse_to_single_cpu(&mut view, &fifos, &executor);
    } else if let Some(count) = opts.cpus {
        ops::set_cpu_count(&mut view, &fifos, &executor, &topology, count)?;
    } else if let Some(cpulist) = opts.cpulist()? {
        ops::set_cpulist(&mut view, &fifos, &executor, &cpulist)?;
    } else if let Some(cpu) = opts.idle {
        ops::idle_one(&mut view, &fifos, &executor, cpu)?;
    } else if let Some(cpu) = opts.wake_up {
        ops::wake_one(&mut view, &fifos, &executor, cpu)?;
    } else if opts.show_metrics {
        for line in ops::format_metrics(&view) {
            println!("{line}");
        }
    } else if let Some(policy) = opts.control {
        let cpu_table: Vec<i32> = (0..view.nr_cpus() as usize).map(|c| view.cpu_physical(c)).collect();
        let core_count = topology.core_count()?;
        let (steps, idle_threshold) = build_step_table(&topology, &cpu_table, policy)?;
        tracing::info!(n_steps = steps.len(), ?policy, "starting controller");

        let mut controller = ControllerLoop::new(
            view,
            Arc::new(fifos),
            Arc::new(executor),
            Arc::new(SysfsFrequencyControl { sysfs_root: config.sysfs_root.clone() }),
            Arc::new(RealBackgroundControl),
            background_job,
            Box::new(SystemClock::new()),
            core_count,
            steps,
            idle_threshold,
        );
        controller.apply_initial_step()?;
        loop {
            controller.tick();
            std::thread::sleep(config.tick_interval);
        }
    } else if opts.print_power {
        println!("{}", ops::format_power(&view));
    } else if opts.print_queues {
        for line in ops::format_queues(&view) {
            println!("{line}");
        }
    } else {
        anyhow::bail!("no mode selected; run with --help to see available operations");
    }

    Ok(())
}
