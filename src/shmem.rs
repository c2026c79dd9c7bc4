//! The shared-memory segment shape and the typed view over it.
//!
//! The control plane never owns the region; a `ShmemView` borrows a
//! `&mut [u8]` for the process lifetime. Accessors read through raw
//! pointers cast from that buffer so the exact same code runs against a
//! real `mmap`-backed segment (`MappedShmem`) and an in-process `Vec<u8>`
//! fixture used by tests.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use static_assertions::const_assert_eq;

pub const NCPU: usize = 128;
pub const ETH_MAX_NUM_FG: usize = 512;
pub const NETHDEV: usize = 16;
pub const ETH_MAX_TOTAL_FG: usize = ETH_MAX_NUM_FG * NETHDEV;
pub const BITS_PER_LONG: usize = 64;
pub const FG_BITMAP_WORDS: usize = ETH_MAX_TOTAL_FG / BITS_PER_LONG;
const_assert_eq!(ETH_MAX_TOTAL_FG % BITS_PER_LONG, 0);

pub const IDLE_FIFO_SIZE: usize = 256;
pub const SCRATCHPAD_LEN: usize = 1024;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CpuMetrics {
    pub queuing_delay: f64,
    pub batch_size: f64,
    pub queue_size: [f64; 3],
    pub loop_duration: i64,
    pub idle: [f64; 3],
    pub padding: [u8; 56],
}
const_assert_eq!(std::mem::size_of::<CpuMetrics>(), 128);

impl Default for CpuMetrics {
    fn default() -> Self {
        Self {
            queuing_delay: 0.0,
            batch_size: 0.0,
            queue_size: [0.0; 3],
            loop_duration: 0,
            idle: [0.0; 3],
            padding: [0; 56],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FlowGroupMetrics {
    pub cpu: u32,
    pub padding: [u8; 60],
}
const_assert_eq!(std::mem::size_of::<FlowGroupMetrics>(), 64);

impl Default for FlowGroupMetrics {
    fn default() -> Self {
        Self {
            cpu: 0,
            padding: [0; 60],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CmdParamsMigrate {
    pub fg_bitmap: [u64; FG_BITMAP_WORDS],
    pub cpu: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CmdParamsIdle {
    pub fifo: [u8; IDLE_FIFO_SIZE],
}

#[repr(C)]
pub union CommandParams {
    pub migrate: CmdParamsMigrate,
    pub idle: CmdParamsIdle,
}

pub const CP_CMD_NOP: u32 = 0;
pub const CP_CMD_MIGRATE: u32 = 1;
pub const CP_CMD_IDLE: u32 = 2;

pub const CP_STATUS_READY: u32 = 0;
pub const CP_STATUS_RUNNING: u32 = 1;

pub const CP_CPU_STATE_IDLE: u32 = 0;
pub const CP_CPU_STATE_RUNNING: u32 = 1;

/// One host<->worker command slot. `cpu_state`, `cmd_id`, `status` and
/// `no_idle` carry acquire/release discipline per the spec's design notes;
/// `params` is plain data because the host only writes it while
/// `status == Ready` and the worker only reads it after observing
/// `status == Running`, so there is no concurrent access to race on.
#[repr(C)]
pub struct CommandSlot {
    pub cpu_state: AtomicU32,
    pub cmd_id: AtomicU32,
    pub status: AtomicU32,
    pub params: CommandParams,
    pub no_idle: AtomicU8,
}

const EXPECTED_COMMAND_SLOT_SIZE: usize = {
    // cpu_state + cmd_id + status
    let head = 4 * 3;
    // params is 8-byte aligned (fg_bitmap is [u64; N]); round head up to 8
    let params_offset = (head + 7) / 8 * 8;
    let migrate_size = FG_BITMAP_WORDS * 8 + 4;
    let params_size = if migrate_size > IDLE_FIFO_SIZE {
        migrate_size
    } else {
        IDLE_FIFO_SIZE
    };
    let params_size = (params_size + 7) / 8 * 8;
    let tail_offset = params_offset + params_size + 1; // + no_idle
    (tail_offset + 7) / 8 * 8
};
const_assert_eq!(
    std::mem::size_of::<CommandSlot>(),
    EXPECTED_COMMAND_SLOT_SIZE
);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Scratchpad {
    pub remote_queue_pkts_begin: i64,
    pub remote_queue_pkts_end: i64,
    pub local_queue_pkts: i64,
    pub backlog_before: i64,
    pub backlog_after: i64,
    pub timers: i64,
    pub timer_fired: i64,
    pub ts_migration_start: i64,
    pub ts_data_structures_done: i64,
    pub ts_before_backlog: i64,
    pub ts_after_backlog: i64,
    pub ts_migration_end: i64,
    pub ts_first_pkt_at_prev: i64,
    pub ts_last_pkt_at_prev: i64,
    pub ts_first_pkt_at_target: i64,
    pub ts_last_pkt_at_target: i64,
}
const_assert_eq!(std::mem::size_of::<Scratchpad>(), 16 * 8);

pub const OFF_NR_FLOW_GROUPS: usize = 0;
pub const OFF_NR_CPUS: usize = 4;
pub const OFF_PKG_POWER: usize = 8;
pub const OFF_CPU_TABLE: usize = 12;
pub const OFF_CPU_METRICS: usize = 576;
pub const OFF_FLOW_GROUP: usize = OFF_CPU_METRICS + NCPU * std::mem::size_of::<CpuMetrics>();
pub const OFF_COMMAND: usize =
    OFF_FLOW_GROUP + ETH_MAX_TOTAL_FG * std::mem::size_of::<FlowGroupMetrics>();
pub const OFF_CYCLES_PER_US: usize = OFF_COMMAND + NCPU * std::mem::size_of::<CommandSlot>();
pub const OFF_SCRATCHPAD_IDX: usize = OFF_CYCLES_PER_US + 4;
pub const OFF_SCRATCHPAD: usize = OFF_SCRATCHPAD_IDX + 4;
pub const SHMEM_SIZE: usize = OFF_SCRATCHPAD + SCRATCHPAD_LEN * std::mem::size_of::<Scratchpad>();

/// Typed, non-owning view over a shared-memory-shaped byte buffer.
pub struct ShmemView<'a> {
    base: &'a mut [u8],
}

impl<'a> ShmemView<'a> {
    /// `buffer` must be at least `SHMEM_SIZE` bytes and live at least as
    /// long as the view; callers (mmap-backed or in-memory fixture alike)
    /// are responsible for that.
    pub fn new(buffer: &'a mut [u8]) -> Result<Self, crate::error::CpError> {
        if buffer.len() < SHMEM_SIZE {
            return Err(crate::error::CpError::ShmUnavailable(format!(
                "segment is {} bytes, expected at least {}",
                buffer.len(),
                SHMEM_SIZE
            )));
        }
        Ok(Self { base: buffer })
    }

    fn ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    fn ptr_mut(&mut self) -> *mut u8 {
        self.base.as_mut_ptr()
    }

    pub fn nr_flow_groups(&self) -> u32 {
        unsafe { std::ptr::read_unaligned(self.ptr().add(OFF_NR_FLOW_GROUPS) as *const u32) }
    }

    pub fn nr_cpus(&self) -> u32 {
        unsafe { std::ptr::read_unaligned(self.ptr().add(OFF_NR_CPUS) as *const u32) }
    }

    pub fn pkg_power(&self) -> f32 {
        unsafe { std::ptr::read_unaligned(self.ptr().add(OFF_PKG_POWER) as *const f32) }
    }

    pub fn set_nr_flow_groups(&mut self, v: u32) {
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(OFF_NR_FLOW_GROUPS) as *mut u32, v) }
    }

    pub fn set_nr_cpus(&mut self, v: u32) {
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(OFF_NR_CPUS) as *mut u32, v) }
    }

    pub fn set_pkg_power(&mut self, v: f32) {
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(OFF_PKG_POWER) as *mut f32, v) }
    }

    /// Physical id of logical cpu `logical`.
    pub fn cpu_physical(&self, logical: usize) -> i32 {
        debug_assert!(logical < NCPU);
        let off = OFF_CPU_TABLE + logical * 4;
        unsafe { std::ptr::read_unaligned(self.ptr().add(off) as *const i32) }
    }

    pub fn set_cpu_physical(&mut self, logical: usize, physical: i32) {
        debug_assert!(logical < NCPU);
        let off = OFF_CPU_TABLE + logical * 4;
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(off) as *mut i32, physical) }
    }

    pub fn cpu_metrics(&self, logical: usize) -> CpuMetrics {
        debug_assert!(logical < NCPU);
        let off = OFF_CPU_METRICS + logical * std::mem::size_of::<CpuMetrics>();
        unsafe { std::ptr::read_unaligned(self.ptr().add(off) as *const CpuMetrics) }
    }

    pub fn set_cpu_metrics(&mut self, logical: usize, m: CpuMetrics) {
        debug_assert!(logical < NCPU);
        let off = OFF_CPU_METRICS + logical * std::mem::size_of::<CpuMetrics>();
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(off) as *mut CpuMetrics, m) }
    }

    pub fn flow_group_cpu(&self, fg: usize) -> u32 {
        debug_assert!(fg < ETH_MAX_TOTAL_FG);
        let off = OFF_FLOW_GROUP + fg * std::mem::size_of::<FlowGroupMetrics>();
        unsafe { std::ptr::read_unaligned(self.ptr().add(off) as *const u32) }
    }

    pub fn set_flow_group_cpu(&mut self, fg: usize, cpu: u32) {
        debug_assert!(fg < ETH_MAX_TOTAL_FG);
        let off = OFF_FLOW_GROUP + fg * std::mem::size_of::<FlowGroupMetrics>();
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(off) as *mut u32, cpu) }
    }

    fn command_offset(cpu: usize) -> usize {
        debug_assert!(cpu < NCPU);
        OFF_COMMAND + cpu * std::mem::size_of::<CommandSlot>()
    }

    /// Borrow the command slot for `cpu`. The returned reference aliases
    /// `self.base`; slots for distinct cpus never alias each other.
    pub fn command(&self, cpu: usize) -> &CommandSlot {
        let off = Self::command_offset(cpu);
        unsafe { &*(self.ptr().add(off) as *const CommandSlot) }
    }

    pub fn command_mut(&mut self, cpu: usize) -> &mut CommandSlot {
        let off = Self::command_offset(cpu);
        unsafe { &mut *(self.ptr_mut().add(off) as *mut CommandSlot) }
    }

    pub fn cycles_per_us(&self) -> u32 {
        unsafe { std::ptr::read_unaligned(self.ptr().add(OFF_CYCLES_PER_US) as *const u32) }
    }

    pub fn set_cycles_per_us(&mut self, v: u32) {
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(OFF_CYCLES_PER_US) as *mut u32, v) }
    }

    pub fn scratchpad_idx(&self) -> u32 {
        unsafe { std::ptr::read_unaligned(self.ptr().add(OFF_SCRATCHPAD_IDX) as *const u32) }
    }

    pub fn set_scratchpad_idx(&mut self, v: u32) {
        unsafe {
            std::ptr::write_unaligned(self.ptr_mut().add(OFF_SCRATCHPAD_IDX) as *mut u32, v)
        }
    }

    pub fn scratchpad(&self, idx: usize) -> Scratchpad {
        debug_assert!(idx < SCRATCHPAD_LEN);
        let off = OFF_SCRATCHPAD + idx * std::mem::size_of::<Scratchpad>();
        unsafe { std::ptr::read_unaligned(self.ptr().add(off) as *const Scratchpad) }
    }

    pub fn set_scratchpad(&mut self, idx: usize, s: Scratchpad) {
        debug_assert!(idx < SCRATCHPAD_LEN);
        let off = OFF_SCRATCHPAD + idx * std::mem::size_of::<Scratchpad>();
        unsafe { std::ptr::write_unaligned(self.ptr_mut().add(off) as *mut Scratchpad, s) }
    }

    /// Escapes the view's borrow into a [`ShmemHandle`] so the controller's
    /// single in-flight step-transition thread can reconstruct a view of
    /// the same bytes without inheriting this view's lifetime. Sound only
    /// under the controller's single-in-flight invariant: the main loop
    /// must not touch the segment again until that thread reports done.
    pub fn raw_handle(&mut self) -> ShmemHandle {
        ShmemHandle {
            ptr: self.ptr_mut(),
            len: self.base.len(),
        }
    }
}

/// See [`ShmemView::raw_handle`].
#[derive(Clone, Copy)]
pub struct ShmemHandle {
    ptr: *mut u8,
    len: usize,
}

// The segment outlives every handle derived from it (it's either a leaked
// mmap or a test buffer kept alive by the caller); the single in-flight
// invariant rules out concurrent access from two handles.
unsafe impl Send for ShmemHandle {}

impl ShmemHandle {
    /// # Safety
    /// The caller must ensure no other `ShmemView`/`ShmemHandle` over the
    /// same bytes is in use concurrently with the returned view.
    pub unsafe fn view<'a>(&self) -> ShmemView<'a> {
        let slice = std::slice::from_raw_parts_mut(self.ptr, self.len);
        ShmemView { base: slice }
    }
}

/// An `mmap`-backed attachment to the dataplane's existing `/ix` POSIX
/// shared-memory segment. The worker process creates and owns the
/// segment; `cpuctl` only ever attaches to it (`O_RDWR`, no `O_CREAT`).
pub struct MappedShmem {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
}

// The mapping is valid for the process lifetime once attached; access is
// synchronized by the command channel's acquire/release discipline.
unsafe impl Send for MappedShmem {}

impl MappedShmem {
    pub fn attach(name: &str) -> Result<Self, crate::error::CpError> {
        use nix::fcntl::OFlag;
        use nix::sys::mman::{mmap, shm_open, MapFlags, ProtFlags};
        use nix::sys::stat::Mode;
        use std::ffi::CString;
        use std::num::NonZeroUsize;

        let cname = CString::new(name).map_err(|e| {
            crate::error::CpError::ShmUnavailable(format!("segment name {name}: {e}"))
        })?;

        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| crate::error::CpError::ShmUnavailable(format!("{name}: {e}")))?;

        let len = NonZeroUsize::new(SHMEM_SIZE)
            .ok_or_else(|| crate::error::CpError::ShmUnavailable("zero-sized segment".to_string()))?;

        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&fd),
                0,
            )
            .map_err(|e| crate::error::CpError::ShmUnavailable(format!("mmap {name}: {e}")))?
        };

        Ok(Self {
            ptr: std::ptr::NonNull::new(ptr.cast()).expect("mmap returned null pointer"),
            len: SHMEM_SIZE,
        })
    }

    pub fn view(&mut self) -> ShmemView<'_> {
        let slice = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        ShmemView { base: slice }
    }
}

impl Drop for MappedShmem {
    fn drop(&mut self) {
        let ptr: *mut std::ffi::c_void = self.ptr.as_ptr().cast();
        let _ = unsafe { nix::sys::mman::munmap(ptr, self.len) };
    }
}

impl CommandSlot {
    pub fn load_status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn load_cpu_state(&self) -> u32 {
        self.cpu_state.load(Ordering::Acquire)
    }

    /// Write `Migrate` params and arm the slot. Caller must have already
    /// observed `Ready`.
    pub fn arm_migrate(&mut self, bitmap: [u64; FG_BITMAP_WORDS], target_cpu: u32) {
        self.params.migrate = CmdParamsMigrate {
            fg_bitmap: bitmap,
            cpu: target_cpu,
        };
        self.status.store(CP_STATUS_RUNNING, Ordering::Release);
        self.cmd_id.store(CP_CMD_MIGRATE, Ordering::Release);
    }

    /// Write `Idle` params and arm the slot. `fifo` must fit with its NUL
    /// terminator inside `IDLE_FIFO_SIZE`.
    pub fn arm_idle(&mut self, fifo: &std::ffi::CStr) {
        let bytes = fifo.to_bytes_with_nul();
        debug_assert!(bytes.len() < IDLE_FIFO_SIZE);
        let mut buf = [0u8; IDLE_FIFO_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        self.params.idle = CmdParamsIdle { fifo: buf };
        self.status.store(CP_STATUS_RUNNING, Ordering::Release);
        self.cmd_id.store(CP_CMD_IDLE, Ordering::Release);
    }

    pub fn set_no_idle(&self, on: bool) {
        self.no_idle.store(on as u8, Ordering::Release);
    }
}

/// Packs a set of flow-group ids into `FG_BITMAP_WORDS` 64-bit words, bit
/// `b` at word `b/64` bit `b%64`.
pub fn bitmap_create<I: IntoIterator<Item = usize>>(on: I) -> [u64; FG_BITMAP_WORDS] {
    let mut bitmap = [0u64; FG_BITMAP_WORDS];
    for pos in on {
        bitmap[pos / BITS_PER_LONG] |= 1u64 << (pos % BITS_PER_LONG);
    }
    bitmap
}

/// Inverse of [`bitmap_create`].
pub fn bitmap_decode(bitmap: &[u64; FG_BITMAP_WORDS]) -> Vec<usize> {
    let mut out = Vec::new();
    for (word_idx, word) in bitmap.iter().enumerate() {
        for bit in 0..BITS_PER_LONG {
            if word & (1u64 << bit) != 0 {
                out.push(word_idx * BITS_PER_LONG + bit);
            }
        }
    }
    out
}
