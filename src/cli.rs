//! Command-line surface.
//!
//! Mirrors the flag set of the original control tool: one primary mode,
//! plus auxiliary flags that only apply to `--control`.

use clap::Parser;

use crate::steps::StepPolicy;

#[derive(Debug, Parser)]
#[command(
    name = "cpuctl",
    version,
    about = "CPU-allocation control plane for the dataplane's shared-memory command channel"
)]
pub struct Opts {
    /// Collapse all flow groups onto CPU 0.
    #[arg(long, group = "mode")]
    pub single_cpu: bool,

    /// Activate exactly N cpus (HT-interleaved ordering).
    #[arg(long, group = "mode", value_name = "N")]
    pub cpus: Option<usize>,

    /// Activate exactly the given comma-separated physical cpu ids.
    #[arg(long, group = "mode", value_name = "A,B,C")]
    pub cpulist: Option<String>,

    /// Park the given logical cpu.
    #[arg(long, group = "mode", value_name = "CPU")]
    pub idle: Option<usize>,

    /// Wake the given logical cpu.
    #[arg(long = "wake-up", group = "mode", value_name = "CPU")]
    pub wake_up: Option<usize>,

    /// Print per-cpu queuing delay and batch size.
    #[arg(long, group = "mode")]
    pub show_metrics: bool,

    /// Run the closed-loop DVFS/rebalancing controller under the given policy.
    #[arg(long, group = "mode", value_enum)]
    pub control: Option<StepPolicy>,

    /// Print the package power reading.
    #[arg(long, group = "mode")]
    pub print_power: bool,

    /// Print per-cpu queue depths for all three tiers.
    #[arg(long, group = "mode")]
    pub print_queues: bool,

    /// Named pipe to write the background task's target thread count to.
    /// Only used with `--control`.
    #[arg(long, value_name = "PATH")]
    pub background_fifo: Option<String>,

    /// PID of the background task whose affinity mask is adjusted.
    /// Only used with `--control`.
    #[arg(long, value_name = "PID")]
    pub background_pid: Option<i32>,

    /// Comma-separated logical cpus reserved for the background task.
    /// Only used with `--control`.
    #[arg(long, value_name = "A,B,C")]
    pub background_cpus: Option<String>,
}

impl Opts {
    pub fn background_cpus(&self) -> anyhow::Result<Option<Vec<usize>>> {
        match &self.background_cpus {
            None => Ok(None),
            Some(s) => {
                let cpus = s
                    .split(',')
                    .map(|tok| tok.trim().parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(cpus))
            }
        }
    }

    pub fn cpulist(&self) -> anyhow::Result<Option<Vec<u32>>> {
        match &self.cpulist {
            None => Ok(None),
            Some(s) => {
                let cpus = s
                    .split(',')
                    .map(|tok| tok.trim().parse::<u32>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(cpus))
            }
        }
    }
}
