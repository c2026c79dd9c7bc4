//! Rebalancer: transitions any current flow-group assignment to a target
//! active-cpu set with bounded per-cpu quotas, issuing the minimum MIGRATE
//! sequence and parking cpus left empty.

use std::collections::VecDeque;

use crate::command::{CommandExecutor, FifoDir};
use crate::shmem::{ShmemView, NCPU};

/// Flow groups owned by each cpu, insertion order preserved (migrations
/// take from the tail). Exclusively owned by the rebalancer.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    per_cpu: Vec<VecDeque<usize>>,
}

impl Assignment {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            per_cpu: vec![VecDeque::new(); nr_cpus.max(NCPU)],
        }
    }

    /// Builds an assignment from a shared-memory view's flow-group table.
    pub fn from_shmem(shmem: &ShmemView<'_>) -> Self {
        let mut assignment = Self::new(NCPU);
        for fg in 0..shmem.nr_flow_groups() as usize {
            let cpu = shmem.flow_group_cpu(fg) as usize;
            assignment.per_cpu[cpu].push_back(fg);
        }
        assignment
    }

    pub fn owned(&self, cpu: usize) -> &VecDeque<usize> {
        &self.per_cpu[cpu]
    }

    pub fn len(&self, cpu: usize) -> usize {
        self.per_cpu[cpu].len()
    }

    pub fn is_empty(&self, cpu: usize) -> bool {
        self.per_cpu[cpu].is_empty()
    }

    pub fn total_flow_groups(&self) -> usize {
        self.per_cpu.iter().map(|q| q.len()).sum()
    }

    /// All flow groups currently assigned, for conservation checks.
    pub fn all_flow_groups(&self) -> Vec<usize> {
        self.per_cpu.iter().flatten().copied().collect()
    }

    fn take_tail(&mut self, cpu: usize, count: usize) -> Vec<usize> {
        let len = self.per_cpu[cpu].len();
        self.per_cpu[cpu].split_off(len - count).into_iter().collect()
    }

    fn extend(&mut self, cpu: usize, flow_groups: &[usize]) {
        self.per_cpu[cpu].extend(flow_groups.iter().copied());
    }
}

/// `base = nr_flow_groups / active_cpus.len()`; the first
/// `nr_flow_groups % active_cpus.len()` entries (in `active_cpus` order)
/// carry `base + 1`.
pub fn quota_for(active_cpus: &[usize], nr_flow_groups: usize, cpu: usize) -> usize {
    let n = active_cpus.len();
    let base = nr_flow_groups / n;
    let remainder = nr_flow_groups % n;
    match active_cpus.iter().position(|&c| c == cpu) {
        Some(idx) if idx < remainder => base + 1,
        Some(_) => base,
        None => 0,
    }
}

/// Transitions `assignment` to `active_cpus`, issuing MIGRATE commands
/// through `executor` and parking any cpu left with no flow groups.
/// Mutates `assignment` in place to reflect the new mapping.
///
/// Deterministic and order-sensitive: see spec §4.4 for the algorithm and
/// its properties.
pub fn set_cpus(
    shmem: &mut ShmemView<'_>,
    fifos: &dyn FifoDir,
    executor: &dyn CommandExecutor,
    assignment: &mut Assignment,
    active_cpus: &[usize],
) {
    let nr_flow_groups = assignment.total_flow_groups();

    for &target in active_cpus {
        shmem.command_mut(target).set_no_idle(true);
        let _ = executor.wake_up(shmem, fifos, target);

        for source in 0..NCPU {
            if source == target {
                continue;
            }
            let target_quota = quota_for(active_cpus, nr_flow_groups, target);
            let deficit = target_quota as isize - assignment.len(target) as isize;
            if deficit <= 0 {
                break;
            }
            let mut count = (deficit as usize).min(assignment.len(source));
            if active_cpus.contains(&source) {
                let source_quota = quota_for(active_cpus, nr_flow_groups, source);
                let source_surplus = assignment.len(source).saturating_sub(source_quota);
                count = count.min(source_surplus);
            }
            if count == 0 {
                continue;
            }
            let moving = assignment.take_tail(source, count);
            executor.migrate(shmem, source, target, &moving);
            assignment.extend(target, &moving);
        }

        shmem.command_mut(target).set_no_idle(false);
    }

    for cpu in 0..shmem.nr_cpus() as usize {
        if assignment.is_empty(cpu) {
            let _ = executor.idle(shmem, fifos, cpu);
        }
    }
}
