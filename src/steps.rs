//! Step Table: derives operating points (active cpu set + frequency) for
//! the three DVFS policies, and the per-step idle threshold used by the
//! controller's down-shift predicate.

use crate::error::CpError;
use crate::topology::TopologySource;

#[derive(Debug, Clone, Copy, clap::ValueEnum, PartialEq, Eq)]
pub enum StepPolicy {
    #[value(name = "eff")]
    EnergyEfficiency,
    #[value(name = "back")]
    BackgroundTask,
    #[value(name = "minmax")]
    MinMax,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Active logical cpus, in the order the rebalancer should target them.
    pub cpus: Vec<usize>,
    pub frequency_khz: u64,
}

/// Builds the step table for `policy` from discovered topology.
///
/// `cpu_list` must be `ht_at_the_end`-ordered, per spec §4.5.
pub fn get_steps(
    policy: StepPolicy,
    core_count: usize,
    frequencies_khz: &[u64],
    cpu_list: &[usize],
) -> Result<Vec<Step>, CpError> {
    if frequencies_khz.is_empty() {
        return Err(CpError::InvalidStepPolicy(
            "no available frequencies".to_string(),
        ));
    }
    if core_count == 0 {
        return Err(CpError::InvalidStepPolicy("core_count is zero".to_string()));
    }

    let min_freq = frequencies_khz[0];
    let max_freq = *frequencies_khz.last().unwrap();

    let mut steps = Vec::new();
    match policy {
        StepPolicy::EnergyEfficiency => {
            for k in 1..=core_count {
                steps.push(Step {
                    cpus: cpu_list[..k].to_vec(),
                    frequency_khz: min_freq,
                });
            }
            for &freq in frequencies_khz {
                steps.push(Step {
                    cpus: cpu_list[..core_count * 2].to_vec(),
                    frequency_khz: freq,
                });
            }
        }
        StepPolicy::BackgroundTask => {
            let second_highest = frequencies_khz[frequencies_khz.len().saturating_sub(2)];
            for k in 1..=core_count {
                let mut cpus = cpu_list[..k].to_vec();
                cpus.extend_from_slice(&cpu_list[core_count..core_count + k]);
                steps.push(Step {
                    cpus,
                    frequency_khz: second_highest,
                });
            }
            steps.push(Step {
                cpus: cpu_list[..core_count * 2].to_vec(),
                frequency_khz: max_freq,
            });
        }
        StepPolicy::MinMax => {
            steps.push(Step {
                cpus: vec![cpu_list[0]],
                frequency_khz: min_freq,
            });
            steps.push(Step {
                cpus: cpu_list[..core_count * 2].to_vec(),
                frequency_khz: max_freq,
            });
        }
    }
    Ok(steps)
}

/// Loads topology facts and builds both the step table and the index-
/// parallel idle-threshold table for `policy`.
pub fn build_step_table(
    source: &dyn TopologySource,
    cpu_table: &[i32],
    policy: StepPolicy,
) -> Result<(Vec<Step>, Vec<f64>), CpError> {
    let core_count = source.core_count()?;
    let frequencies = source.available_frequencies_khz()?;
    let lists = crate::topology::compute_cpu_lists(source, cpu_table)?;
    let steps = get_steps(policy, core_count, &frequencies, &lists.ht_at_the_end)?;
    let thresholds = calculate_idle_threshold(&steps, core_count);
    Ok((steps, thresholds))
}

/// Index-parallel with `steps`. Entry 0 is fixed at `2 * 1.2`.
pub fn calculate_idle_threshold(steps: &[Step], core_count: usize) -> Vec<f64> {
    if steps.is_empty() {
        return Vec::new();
    }
    let turbo_frequency = steps.iter().map(|s| s.frequency_khz).max().unwrap();

    let mut thresholds = vec![2.0f64];
    for i in 1..steps.len() {
        let step = &steps[i];
        let prev = &steps[i - 1];
        let raw = if step.cpus.len() == core_count * 2 && prev.cpus.len() == core_count {
            1.0 - 1.0 / 1.3
        } else if step.cpus.len() != prev.cpus.len() {
            let primaries = step.cpus.iter().filter(|&&c| c < core_count).count();
            1.0 / primaries as f64
        } else if step.frequency_khz != turbo_frequency {
            (step.frequency_khz as f64 - prev.frequency_khz as f64) / step.frequency_khz as f64
        } else {
            0.1
        };
        thresholds.push(raw);
    }

    for t in thresholds.iter_mut() {
        *t *= 1.2;
    }
    thresholds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minmax_steps_and_thresholds_match_s5() {
        let cpu_list: Vec<usize> = (0..8).collect();
        let steps = get_steps(StepPolicy::MinMax, 4, &[1_000_000, 3_000_000], &cpu_list).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].cpus, vec![0]);
        assert_eq!(steps[0].frequency_khz, 1_000_000);
        assert_eq!(steps[1].cpus, (0..8).collect::<Vec<_>>());
        assert_eq!(steps[1].frequency_khz, 3_000_000);

        let thresholds = calculate_idle_threshold(&steps, 4);
        assert_eq!(thresholds.len(), 2);
        assert!((thresholds[0] - 2.4).abs() < 1e-9);
        assert!((thresholds[1] - 0.12).abs() < 1e-9);
    }

    #[test]
    fn energy_efficiency_scales_cores_then_frequency() {
        let cpu_list: Vec<usize> = (0..4).collect();
        let steps =
            get_steps(StepPolicy::EnergyEfficiency, 2, &[1_000_000, 2_000_000], &cpu_list)
                .unwrap();
        // 2 core-scaling steps + 2 frequency steps.
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].cpus, vec![0]);
        assert_eq!(steps[1].cpus, vec![0, 1]);
        assert_eq!(steps[2].cpus, vec![0, 1, 2, 3]);
        assert_eq!(steps[2].frequency_khz, 1_000_000);
        assert_eq!(steps[3].frequency_khz, 2_000_000);
    }

    #[test]
    fn background_task_reserves_second_highest_frequency() {
        let cpu_list: Vec<usize> = (0..4).collect();
        let steps = get_steps(
            StepPolicy::BackgroundTask,
            2,
            &[1_000_000, 2_000_000, 3_000_000],
            &cpu_list,
        )
        .unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].cpus, vec![0, 2]);
        assert_eq!(steps[0].frequency_khz, 2_000_000);
        assert_eq!(steps[1].cpus, vec![0, 1, 2, 3]);
        assert_eq!(steps[1].frequency_khz, 2_000_000);
        assert_eq!(steps[2].frequency_khz, 3_000_000);
    }

    #[test]
    fn threshold_table_length_matches_steps_for_every_policy() {
        let cpu_list: Vec<usize> = (0..8).collect();
        for policy in [
            StepPolicy::EnergyEfficiency,
            StepPolicy::BackgroundTask,
            StepPolicy::MinMax,
        ] {
            let steps = get_steps(policy, 4, &[1_000_000, 2_000_000, 3_000_000], &cpu_list)
                .unwrap();
            let thresholds = calculate_idle_threshold(&steps, 4);
            assert_eq!(thresholds.len(), steps.len());
            assert!((thresholds[0] - 2.4).abs() < 1e-9);
            assert!(thresholds.iter().all(|&t| t >= 0.0));
        }
    }
}
