//! Closed-loop controller: samples queue-depth and idle metrics every
//! tick and drives step transitions through an asymmetric hysteresis
//! predicate, per spec §4.7.
//!
//! A step transition (frequency change, active-cpu rebalance,
//! background-task reservation) runs on a single spawned thread so the
//! main loop keeps sampling and printing trace lines while it's in
//! flight; at most one transition is ever in flight (`pending`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::background::{self, BackgroundControl, BackgroundJob};
use crate::command::{CommandExecutor, FifoDir};
use crate::error::CpError;
use crate::rebalance::{self, Assignment};
use crate::shmem::{ShmemHandle, ShmemView, CP_CPU_STATE_RUNNING};
use crate::steps::Step;

const UP_QUEUE_THRESHOLD: f64 = 32.0;
const UP_COOLDOWN_AFTER_UP: Duration = Duration::from_millis(200);
const UP_COOLDOWN_AFTER_DOWN: Duration = Duration::from_secs(2);
const DOWN_QUEUE_THRESHOLD: f64 = 8.0;
const DOWN_COOLDOWN_AFTER_UP: Duration = Duration::from_secs(4);
const DOWN_COOLDOWN_AFTER_DOWN: Duration = Duration::from_secs(4);

/// Injectable wall clock so hysteresis cooldowns can be driven by a
/// synthetic timeline in tests instead of real sleeps.
pub trait Clock {
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Writes the target frequency to every cpu's `cpufreq` sysfs node.
pub trait FrequencyControl: Send + Sync {
    fn set_frequency(&self, freq_khz: u64) -> Result<(), CpError>;
}

pub struct SysfsFrequencyControl {
    pub sysfs_root: PathBuf,
}

impl FrequencyControl for SysfsFrequencyControl {
    fn set_frequency(&self, freq_khz: u64) -> Result<(), CpError> {
        let entries = std::fs::read_dir(&self.sysfs_root)
            .map_err(|e| CpError::TopologyUnavailable(format!("{}: {}", self.sysfs_root.display(), e)))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("cpu") || !name[3..].chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let cpufreq = entry.path().join("cpufreq");
            if !cpufreq.is_dir() {
                continue;
            }
            std::fs::write(cpufreq.join("scaling_governor"), b"userspace\n")
                .map_err(|e| CpError::TopologyUnavailable(e.to_string()))?;
            std::fs::write(cpufreq.join("scaling_setspeed"), format!("{freq_khz}\n"))
                .map_err(|e| CpError::TopologyUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

struct TransitionOutcome {
    assignment: Assignment,
    scratchpad_from: u32,
    scratchpad_to: u32,
}

struct PendingTransition {
    handle: JoinHandle<TransitionOutcome>,
    done: Arc<AtomicBool>,
}

/// Per-tick queue/idle averages the hysteresis predicate acts on.
#[derive(Debug, Clone, Copy, Default)]
struct TickMetrics {
    fast_queue_size: f64,
    medium_queue_size: f64,
    slow_queue_size: f64,
    idle_fast: f64,
    idle_medium: f64,
    idle_slow: f64,
    loop_duration: f64,
}

fn sample(shmem: &ShmemView<'_>) -> TickMetrics {
    let running: Vec<_> = (0..shmem.nr_cpus() as usize)
        .filter(|&c| shmem.command(c).load_cpu_state() == CP_CPU_STATE_RUNNING)
        .map(|c| shmem.cpu_metrics(c))
        .collect();
    if running.is_empty() {
        return TickMetrics::default();
    }
    let avg = |f: fn(&crate::shmem::CpuMetrics) -> f64| {
        running.iter().map(f).sum::<f64>() / running.len() as f64
    };
    TickMetrics {
        fast_queue_size: running.iter().map(|m| m.queue_size[0]).fold(f64::MIN, f64::max),
        medium_queue_size: avg(|m| m.queue_size[1]),
        slow_queue_size: avg(|m| m.queue_size[2]),
        idle_fast: avg(|m| m.idle[0]),
        idle_medium: avg(|m| m.idle[1]),
        idle_slow: avg(|m| m.idle[2]),
        loop_duration: avg(|m| m.loop_duration as f64),
    }
}

/// Drives step transitions for one control session. Owns the flow-group
/// assignment while no transition is in flight; a spawned thread owns it
/// for the duration of a transition.
pub struct ControllerLoop {
    shmem: ShmemHandle,
    fifos: Arc<dyn FifoDir + Send + Sync>,
    executor: Arc<dyn CommandExecutor + Send + Sync>,
    frequency: Arc<dyn FrequencyControl>,
    background_ctrl: Arc<dyn BackgroundControl + Send + Sync>,
    background_job: Option<BackgroundJob>,
    clock: Box<dyn Clock>,
    core_count: usize,
    steps: Vec<Step>,
    idle_threshold: Vec<f64>,
    curr_step_idx: usize,
    /// `None` until the first up/down-shift: cooldowns never block a
    /// direction that has never fired.
    last_up: Option<Duration>,
    last_down: Option<Duration>,
    assignment: Option<Assignment>,
    pending: Option<PendingTransition>,
}

impl ControllerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut shmem: ShmemView<'_>,
        fifos: Arc<dyn FifoDir + Send + Sync>,
        executor: Arc<dyn CommandExecutor + Send + Sync>,
        frequency: Arc<dyn FrequencyControl>,
        background_ctrl: Arc<dyn BackgroundControl + Send + Sync>,
        background_job: Option<BackgroundJob>,
        clock: Box<dyn Clock>,
        core_count: usize,
        steps: Vec<Step>,
        idle_threshold: Vec<f64>,
    ) -> Self {
        let assignment = Assignment::from_shmem(&shmem);
        let handle = shmem.raw_handle();
        Self {
            shmem: handle,
            fifos,
            executor,
            frequency,
            background_ctrl,
            background_job,
            clock,
            core_count,
            steps,
            idle_threshold,
            curr_step_idx: 0,
            last_up: None,
            last_down: None,
            assignment: Some(assignment),
            pending: None,
        }
    }

    fn view<'a>(&self) -> ShmemView<'a> {
        // Safety: see `ShmemHandle::view` — sound because no transition is
        // in flight whenever the main loop reads through this handle
        // (the pending thread exclusively owns the segment until done).
        unsafe { self.shmem.view() }
    }

    pub fn apply_initial_step(&mut self) -> Result<(), CpError> {
        let step = self.steps[0].clone();
        let mut assignment = self.assignment.take().expect("no transition in flight");
        apply_step(
            &self.shmem,
            self.fifos.as_ref(),
            self.executor.as_ref(),
            self.frequency.as_ref(),
            self.background_ctrl.as_ref(),
            self.background_job.as_ref(),
            self.core_count,
            &step,
            Direction::Up,
            &mut assignment,
        )?;
        self.assignment = Some(assignment);
        Ok(())
    }

    /// Runs one control iteration: sample, reap a finished transition if
    /// any, and decide whether to start a new one. Callers sleep the
    /// configured tick interval between calls.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        let metrics = sample(&self.view());
        tracing::debug!(
            ?now,
            fast_queue_size = metrics.fast_queue_size,
            medium_queue_size = metrics.medium_queue_size,
            slow_queue_size = metrics.slow_queue_size,
            idle_fast = metrics.idle_fast,
            idle_medium = metrics.idle_medium,
            idle_slow = metrics.idle_slow,
            loop_duration = metrics.loop_duration,
            "controller tick"
        );

        self.reap_finished_transition();

        if self.pending.is_some() {
            return;
        }

        let elapsed_since = |last: Option<Duration>, cooldown: Duration| match last {
            None => true,
            Some(t) => now.saturating_sub(t) >= cooldown,
        };

        let mut new_step_idx = self.curr_step_idx;
        if metrics.fast_queue_size > UP_QUEUE_THRESHOLD
            && self.curr_step_idx < self.steps.len() - 1
            && elapsed_since(self.last_up, UP_COOLDOWN_AFTER_UP)
            && elapsed_since(self.last_down, UP_COOLDOWN_AFTER_DOWN)
        {
            new_step_idx = self.curr_step_idx + 1;
        } else if metrics.slow_queue_size < DOWN_QUEUE_THRESHOLD
            && metrics.idle_fast > self.idle_threshold[self.curr_step_idx]
            && self.curr_step_idx > 0
            && elapsed_since(self.last_up, DOWN_COOLDOWN_AFTER_UP)
            && elapsed_since(self.last_down, DOWN_COOLDOWN_AFTER_DOWN)
        {
            new_step_idx = self.curr_step_idx - 1;
        }

        if new_step_idx == self.curr_step_idx {
            return;
        }

        let direction = if new_step_idx > self.curr_step_idx {
            self.last_up = Some(now);
            Direction::Up
        } else {
            self.last_down = Some(now);
            Direction::Down
        };
        self.curr_step_idx = new_step_idx;
        self.spawn_transition(direction);
    }

    fn spawn_transition(&mut self, direction: Direction) {
        let step = self.steps[self.curr_step_idx].clone();
        let mut assignment = self.assignment.take().expect("no transition in flight");
        let shmem = self.shmem;
        let fifos = Arc::clone(&self.fifos);
        let executor = Arc::clone(&self.executor);
        let frequency = Arc::clone(&self.frequency);
        let background_ctrl = Arc::clone(&self.background_ctrl);
        let background_job = self.background_job.clone();
        let core_count = self.core_count;
        let scratchpad_from = self.view().scratchpad_idx();

        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let handle = std::thread::spawn(move || {
            let _ = apply_step(
                &shmem,
                fifos.as_ref(),
                executor.as_ref(),
                frequency.as_ref(),
                background_ctrl.as_ref(),
                background_job.as_ref(),
                core_count,
                &step,
                direction,
                &mut assignment,
            );
            let scratchpad_to = unsafe { shmem.view() }.scratchpad_idx();
            done_flag.store(true, Ordering::Release);
            TransitionOutcome {
                assignment,
                scratchpad_from,
                scratchpad_to,
            }
        });

        self.pending = Some(PendingTransition { handle, done });
    }

    fn reap_finished_transition(&mut self) {
        let Some(pending) = &self.pending else { return };
        if !pending.done.load(Ordering::Acquire) {
            return;
        }
        let pending = self.pending.take().unwrap();
        let outcome = pending.handle.join().expect("transition thread panicked");
        self.assignment = Some(outcome.assignment);
        self.emit_scratchpad_summary(outcome.scratchpad_from, outcome.scratchpad_to);
    }

    fn emit_scratchpad_summary(&self, from: u32, to: u32) {
        let view = self.view();
        let cycles_per_us = view.cycles_per_us().max(1) as i64;
        for idx in from..to {
            let s = view.scratchpad(idx as usize);
            tracing::info!(
                idx,
                remote_queue_pkts_begin = s.remote_queue_pkts_begin,
                remote_queue_pkts_end = s.remote_queue_pkts_end,
                local_queue_pkts = s.local_queue_pkts,
                backlog_before = s.backlog_before,
                backlog_after = s.backlog_after,
                timers = s.timers,
                timer_fired = s.timer_fired,
                total_us = (s.ts_migration_end - s.ts_migration_start) / cycles_per_us,
                structs_us = (s.ts_data_structures_done - s.ts_migration_start) / cycles_per_us,
                rpc_us = (s.ts_before_backlog - s.ts_first_pkt_at_target) / cycles_per_us,
                backlog_us = (s.ts_after_backlog - s.ts_before_backlog) / cycles_per_us,
                "control_done"
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_step(
    shmem: &ShmemHandle,
    fifos: &dyn FifoDir,
    executor: &dyn CommandExecutor,
    frequency: &dyn FrequencyControl,
    background_ctrl: &dyn BackgroundControl,
    background_job: Option<&BackgroundJob>,
    core_count: usize,
    step: &Step,
    direction: Direction,
    assignment: &mut Assignment,
) -> Result<(), CpError> {
    let primaries = step.cpus.iter().filter(|&&c| c < core_count).count();

    if direction == Direction::Up {
        background::control_background_job(background_ctrl, background_job, primaries)?;
    }

    frequency.set_frequency(step.frequency_khz)?;
    {
        let mut view = unsafe { shmem.view() };
        rebalance::set_cpus(&mut view, fifos, executor, assignment, &step.cpus);
    }

    if direction == Direction::Down {
        background::control_background_job(background_ctrl, background_job, primaries)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_support::{FakeFifoDir, InstantExecutor};
    use crate::shmem::SHMEM_SIZE;
    use std::cell::Cell;

    struct FakeFrequencyControl;
    impl FrequencyControl for FakeFrequencyControl {
        fn set_frequency(&self, _freq_khz: u64) -> Result<(), CpError> {
            Ok(())
        }
    }

    struct NullBackgroundControl;
    impl BackgroundControl for NullBackgroundControl {
        fn write_thread_count(&self, _fifo: &std::path::Path, _count: usize) -> std::io::Result<()> {
            Ok(())
        }
        fn set_affinity(&self, _pid: i32, _mask: u64) -> Result<(), CpError> {
            Ok(())
        }
    }

    struct FakeClock {
        now: Cell<Duration>,
    }
    impl FakeClock {
        fn new() -> Self {
            Self { now: Cell::new(Duration::ZERO) }
        }
        fn advance(&self, d: Duration) {
            self.now.set(self.now.get() + d);
        }
    }
    impl Clock for FakeClock {
        fn now(&self) -> Duration {
            self.now.get()
        }
    }

    fn two_step_loop(buf: &mut [u8]) -> (ControllerLoop, Arc<FakeClock>) {
        let mut v = ShmemView::new(buf).unwrap();
        v.set_nr_cpus(2);
        v.set_cpu_physical(0, 0);
        v.set_cpu_physical(1, 1);
        v.set_nr_flow_groups(2);
        v.set_flow_group_cpu(0, 0);
        v.set_flow_group_cpu(1, 0);
        // A real dataplane worker starts out running; nothing in cpuctl
        // ever sets this bit to Running on its own except a wake_up of an
        // already-parked cpu, so the fixture must seed it directly.
        for cpu in 0..2 {
            v.command_mut(cpu)
                .cpu_state
                .store(CP_CPU_STATE_RUNNING, Ordering::Release);
        }

        let steps = vec![
            Step { cpus: vec![0], frequency_khz: 1_000_000 },
            Step { cpus: vec![0, 1], frequency_khz: 2_000_000 },
        ];
        let idle_threshold = vec![2.4, 0.12];
        let clock = Arc::new(FakeClock::new());

        let ctrl = ControllerLoop::new(
            v,
            Arc::new(FakeFifoDir::default()),
            Arc::new(InstantExecutor),
            Arc::new(FakeFrequencyControl),
            Arc::new(NullBackgroundControl),
            None,
            Box::new(ClockHandle(Arc::clone(&clock))),
            1,
            steps,
            idle_threshold,
        );
        (ctrl, clock)
    }

    struct ClockHandle(Arc<FakeClock>);
    impl Clock for ClockHandle {
        fn now(&self) -> Duration {
            self.0.now()
        }
    }

    fn set_queue_depth(shmem_handle: &ShmemHandle, cpu: usize, fast: f64, slow: f64) {
        let mut view = unsafe { shmem_handle.view() };
        let mut m = view.cpu_metrics(cpu);
        m.queue_size[0] = fast;
        m.queue_size[2] = slow;
        view.set_cpu_metrics(cpu, m);
    }

    #[test]
    fn up_shift_fires_on_the_first_tick_once_queued() {
        // No prior transition means no cooldown to wait out, matching the
        // original's `last_up = last_down = 0` (epoch) initialization.
        let mut buf = vec![0u8; SHMEM_SIZE];
        let (mut ctrl, _clock) = two_step_loop(&mut buf);
        ctrl.apply_initial_step().unwrap();
        set_queue_depth(&ctrl.shmem, 0, 100.0, 0.0);

        ctrl.tick();
        assert_eq!(ctrl.curr_step_idx, 1, "queue pressure should step up immediately");
    }

    #[test]
    fn down_shift_waits_out_the_up_cooldown() {
        let mut buf = vec![0u8; SHMEM_SIZE];
        let (mut ctrl, clock) = two_step_loop(&mut buf);
        ctrl.apply_initial_step().unwrap();
        set_queue_depth(&ctrl.shmem, 0, 100.0, 0.0);
        ctrl.tick();
        assert_eq!(ctrl.curr_step_idx, 1);

        // reap the up-shift before testing the down-shift.
        while ctrl.pending.is_some() {
            ctrl.tick();
        }

        set_queue_depth(&ctrl.shmem, 0, 0.0, 0.0);
        {
            let mut view = unsafe { ctrl.shmem.view() };
            let mut m = view.cpu_metrics(0);
            m.idle[0] = 10.0;
            view.set_cpu_metrics(0, m);
        }

        ctrl.tick();
        assert_eq!(ctrl.curr_step_idx, 1, "cooldown after the up-shift hasn't elapsed yet");

        clock.advance(Duration::from_secs(5));
        ctrl.tick();
        assert_eq!(ctrl.curr_step_idx, 0, "low load and high idle past cooldown should step down");
    }
}
