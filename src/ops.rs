//! One-shot operations exposed by the CLI: everything except `--control`,
//! which runs the closed-loop controller in `controller.rs`.

use crate::command::{CommandExecutor, FifoDir};
use crate::error::CpError;
use crate::rebalance::{self, Assignment};
use crate::shmem::{ShmemView, CP_CPU_STATE_RUNNING};
use crate::topology::{compute_cpu_lists, TopologySource};

/// Moves every flow group onto logical cpu 0 and parks everything else.
pub fn collapse_to_single_cpu(
    shmem: &mut ShmemView<'_>,
    fifos: &dyn FifoDir,
    executor: &dyn CommandExecutor,
) {
    let mut assignment = Assignment::from_shmem(shmem);
    rebalance::set_cpus(shmem, fifos, executor, &mut assignment, &[0]);
}

/// Activates exactly `count` cpus, in HT-interleaved order.
pub fn set_cpu_count(
    shmem: &mut ShmemView<'_>,
    fifos: &dyn FifoDir,
    executor: &dyn CommandExecutor,
    topology: &dyn TopologySource,
    count: usize,
) -> Result<(), CpError> {
    let cpu_table = cpu_table(shmem);
    let lists = compute_cpu_lists(topology, &cpu_table)?;
    let active: Vec<usize> = lists.ht_interleaved.into_iter().take(count).collect();
    let mut assignment = Assignment::from_shmem(shmem);
    rebalance::set_cpus(shmem, fifos, executor, &mut assignment, &active);
    Ok(())
}

/// Activates exactly the given physical cpu ids, translated through the
/// shared memory's physical-to-logical table.
pub fn set_cpulist(
    shmem: &mut ShmemView<'_>,
    fifos: &dyn FifoDir,
    executor: &dyn CommandExecutor,
    physical_cpus: &[u32],
) -> Result<(), CpError> {
    let nr_cpus = shmem.nr_cpus() as usize;
    let active = physical_cpus
        .iter()
        .map(|&physical| {
            (0..nr_cpus)
                .find(|&logical| shmem.cpu_physical(logical) as u32 == physical)
                .ok_or(CpError::InvalidCpulist(physical))
        })
        .collect::<Result<Vec<usize>, _>>()?;
    let mut assignment = Assignment::from_shmem(shmem);
    rebalance::set_cpus(shmem, fifos, executor, &mut assignment, &active);
    Ok(())
}

pub fn idle_one(
    shmem: &mut ShmemView<'_>,
    fifos: &dyn FifoDir,
    executor: &dyn CommandExecutor,
    cpu: usize,
) -> Result<(), CpError> {
    executor.idle(shmem, fifos, cpu)
}

pub fn wake_one(
    shmem: &mut ShmemView<'_>,
    fifos: &dyn FifoDir,
    executor: &dyn CommandExecutor,
    cpu: usize,
) -> Result<(), CpError> {
    executor.wake_up(shmem, fifos, cpu)
}

fn cpu_table(shmem: &ShmemView<'_>) -> Vec<i32> {
    (0..shmem.nr_cpus() as usize)
        .map(|logical| shmem.cpu_physical(logical))
        .collect()
}

/// `cpu: queuing delay us, batch size pkts` lines for every running cpu.
pub fn format_metrics(shmem: &ShmemView<'_>) -> Vec<String> {
    (0..shmem.nr_cpus() as usize)
        .map(|cpu| {
            let m = shmem.cpu_metrics(cpu);
            format!(
                "CPU {cpu}: queuing delay: {:.0} us, batch size: {:.0} pkts",
                m.queuing_delay, m.batch_size
            )
        })
        .collect()
}

pub fn format_power(shmem: &ShmemView<'_>) -> String {
    format!("{}", shmem.pkg_power())
}

/// `cpu fast/medium/slow` queue depths for every cpu currently running.
pub fn format_queues(shmem: &ShmemView<'_>) -> Vec<String> {
    (0..shmem.nr_cpus() as usize)
        .filter(|&cpu| shmem.command(cpu).load_cpu_state() == CP_CPU_STATE_RUNNING)
        .map(|cpu| {
            let q = shmem.cpu_metrics(cpu).queue_size;
            format!("{cpu} {:.0}/{:.0}/{:.0}", q[0], q[1], q[2])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_support::{FakeFifoDir, InstantExecutor};
    use crate::shmem::SHMEM_SIZE;
    use crate::topology::StaticTopologySource;
    use std::collections::HashMap;

    fn seeded_shmem(buf: &mut [u8], nr_cpus: u32, nr_flow_groups: u32) -> ShmemView<'_> {
        let mut v = ShmemView::new(buf).unwrap();
        v.set_nr_cpus(nr_cpus);
        v.set_nr_flow_groups(nr_flow_groups);
        for logical in 0..nr_cpus as usize {
            v.set_cpu_physical(logical, logical as i32);
        }
        for fg in 0..nr_flow_groups as usize {
            v.set_flow_group_cpu(fg, (fg % nr_cpus as usize) as u32);
        }
        v
    }

    #[test]
    fn collapse_to_single_cpu_moves_everything_to_cpu_zero() {
        let mut buf = vec![0u8; SHMEM_SIZE];
        let mut v = seeded_shmem(&mut buf, 4, 8);
        let fifos = FakeFifoDir::default();
        let executor = InstantExecutor;
        collapse_to_single_cpu(&mut v, &fifos, &executor);
        for fg in 0..8 {
            assert_eq!(v.flow_group_cpu(fg), 0);
        }
    }

    #[test]
    fn set_cpulist_rejects_unknown_physical_cpu() {
        let mut buf = vec![0u8; SHMEM_SIZE];
        let mut v = seeded_shmem(&mut buf, 4, 4);
        let fifos = FakeFifoDir::default();
        let executor = InstantExecutor;
        let err = set_cpulist(&mut v, &fifos, &executor, &[99]).unwrap_err();
        assert!(matches!(err, CpError::InvalidCpulist(99)));
    }

    #[test]
    fn set_cpu_count_activates_ht_interleaved_prefix() {
        let mut buf = vec![0u8; SHMEM_SIZE];
        let mut v = seeded_shmem(&mut buf, 4, 4);
        let mut siblings = HashMap::new();
        siblings.insert(0, vec![0, 2]);
        siblings.insert(1, vec![1, 3]);
        siblings.insert(2, vec![0, 2]);
        siblings.insert(3, vec![1, 3]);
        let topology = StaticTopologySource {
            core_count: 2,
            siblings,
            frequencies_khz: vec![1_000_000],
        };
        let fifos = FakeFifoDir::default();
        let executor = InstantExecutor;
        set_cpu_count(&mut v, &fifos, &executor, &topology, 2).unwrap();
        for fg in 0..4 {
            assert!(v.flow_group_cpu(fg) == 0 || v.flow_group_cpu(fg) == 2);
        }
    }
}
