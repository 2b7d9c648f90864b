//! # Host model of a multi-core chip
//!
//! [`EmulatedSmp`] implements [`Port`](crate::Port) on top of `std` threads so
//! the flash guard, and drivers built on it, can be exercised on the host.
//!
//! - A thread acts as a core once [`EmulatedSmp::bind_current_thread`] was
//!   called on it (unbound threads run on [`Cpu::ProCpu`]).
//! - [`EmulatedSmp::spawn_ipc_tasks`] starts one IPC task thread per core.
//!   While it services a request, user threads of that core cannot suspend
//!   their scheduler, which models the IPC task preempting them.
//! - Caches, scheduler suspension, interrupt masks and stalls are plain
//!   per-core flags. Every change is appended to an ordered [`Event`] log.
//! - Stalling a core only sets its flag. Threads bound to a stalled core keep
//!   running, so tests can check when a stall happens relative to other
//!   events but not that the stalled core actually stops.
//! - [`EmulatedSmp::with_quiescence_polls`] and
//!   [`EmulatedSmp::with_ipc_delay`] inject delays into the protocol.

use std::{
    cell::Cell,
    panic,
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
    vec::Vec,
};

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    FlashGuardContext,
    port::{
        CacheController,
        CoreIdentity,
        Cpu,
        CpuStall,
        InterProcessorCall,
        InterruptControl,
        IpcError,
        ParkRequest,
        Scheduler,
    },
};

/// Region mask every emulated cache starts with.
pub const DEFAULT_REGIONS: u32 = 0b11;

/// A state change recorded by [`EmulatedSmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The cache enable bit of a core was cleared.
    CacheDisabled(Cpu),
    /// The cache enable bit of a core was set.
    CacheRestored(Cpu),
    /// A core suspended its scheduler.
    SchedulerSuspended(Cpu),
    /// A core resumed its scheduler.
    SchedulerResumed(Cpu),
    /// Non-IRAM interrupts were masked on a core.
    InterruptsMasked(Cpu),
    /// Non-IRAM interrupts were unmasked on a core.
    InterruptsUnmasked(Cpu),
    /// A park request was sent.
    ParkRequested {
        /// Sending core.
        from: Cpu,
        /// Receiving core.
        to: Cpu,
    },
    /// A core was stalled.
    Stalled(Cpu),
    /// A core was un-stalled.
    Unstalled(Cpu),
    /// A parked core was allowed to continue.
    Released(Cpu),
    /// A label recorded by a test through [`EmulatedSmp::mark`].
    Marker(Cpu, &'static str),
}

/// Observable state of one emulated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreSnapshot {
    /// Cache enable bit.
    pub cache_enabled: bool,
    /// Enabled cache regions.
    pub regions: u32,
    /// Scheduler suspended.
    pub scheduler_suspended: bool,
    /// Non-IRAM interrupts masked.
    pub interrupts_masked: bool,
    /// Core stalled.
    pub stalled: bool,
}

struct CoreModel {
    cache_enabled: AtomicBool,
    regions: AtomicU32,
    busy_polls: AtomicU32,
    suspended: AtomicU32,
    masked: AtomicBool,
    stalled: AtomicBool,
    servicing_ipc: AtomicBool,
    ipc: Mutex<Option<mpsc::Sender<ParkRequest>>>,
}

impl CoreModel {
    fn new() -> Self {
        Self {
            cache_enabled: AtomicBool::new(true),
            regions: AtomicU32::new(DEFAULT_REGIONS),
            busy_polls: AtomicU32::new(0),
            suspended: AtomicU32::new(0),
            masked: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            servicing_ipc: AtomicBool::new(false),
            ipc: Mutex::new(None),
        }
    }
}

thread_local! {
    static CURRENT_CORE: Cell<Cpu> = const { Cell::new(Cpu::ProCpu) };
    static IN_IPC_TASK: Cell<bool> = const { Cell::new(false) };
}

/// A multi-core chip made of host threads.
pub struct EmulatedSmp {
    cores: usize,
    started: AtomicBool,
    quiescence_polls: u32,
    ipc_delay: Duration,
    core: [CoreModel; Cpu::COUNT],
    events: Mutex<Vec<Event>>,
    unsafe_disables: AtomicU32,
}

impl EmulatedSmp {
    /// Creates a chip with `cores` cores, caches enabled and the scheduler
    /// not started.
    pub fn new(cores: usize) -> Self {
        assert!(
            (1..=Cpu::COUNT).contains(&cores),
            "unsupported core count {}",
            cores
        );

        Self {
            cores,
            started: AtomicBool::new(false),
            quiescence_polls: 0,
            ipc_delay: Duration::ZERO,
            core: [CoreModel::new(), CoreModel::new()],
            events: Mutex::new(Vec::new()),
            unsafe_disables: AtomicU32::new(0),
        }
    }

    /// Every enabled cache reports `polls` in-flight transactions before it
    /// becomes quiescent.
    pub fn with_quiescence_polls(mut self, polls: u32) -> Self {
        self.quiescence_polls = polls;
        for model in &self.core {
            model.busy_polls.store(polls, Ordering::SeqCst);
        }
        self
    }

    /// IPC tasks wait `delay` before servicing a request.
    pub fn with_ipc_delay(mut self, delay: Duration) -> Self {
        self.ipc_delay = delay;
        self
    }

    /// Starts the scheduler on every core.
    pub fn start_scheduler(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Makes the calling thread execute on `cpu`.
    pub fn bind_current_thread(cpu: Cpu) {
        CURRENT_CORE.set(cpu);
    }

    /// Spawns a thread executing on `cpu`.
    pub fn on_core<R, F>(cpu: Cpu, f: F) -> JoinHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        thread::spawn(move || {
            Self::bind_current_thread(cpu);
            f()
        })
    }

    /// Starts the IPC task of every core. The tasks stop when the returned
    /// handle is dropped.
    pub fn spawn_ipc_tasks(guard: &Arc<FlashGuardContext<EmulatedSmp>>) -> IpcTasks {
        let port = guard.port();
        let mut handles = Vec::new();

        for cpu in Cpu::all(port.cores) {
            let (sender, receiver) = mpsc::channel::<ParkRequest>();
            *port.ipc_sender(cpu) = Some(sender);

            let guard = guard.clone();
            handles.push(thread::spawn(move || {
                CURRENT_CORE.set(cpu);
                IN_IPC_TASK.set(true);

                while let Ok(request) = receiver.recv() {
                    let port = guard.port();
                    let model = port.model(cpu);

                    model.servicing_ipc.store(true, Ordering::SeqCst);
                    if !port.ipc_delay.is_zero() {
                        thread::sleep(port.ipc_delay);
                    }
                    guard.handle_ipc(request);
                    model.servicing_ipc.store(false, Ordering::SeqCst);
                }
            }));
        }

        IpcTasks {
            guard: guard.clone(),
            handles,
        }
    }

    /// Records a label in the event log, attributed to the calling core.
    pub fn mark(&self, label: &'static str) {
        self.record(Event::Marker(self.current_core(), label));
    }

    /// Returns a copy of the event log.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clears the event log.
    pub fn clear_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// State of `cpu`.
    pub fn snapshot(&self, cpu: Cpu) -> CoreSnapshot {
        let model = self.model(cpu);
        CoreSnapshot {
            cache_enabled: model.cache_enabled.load(Ordering::SeqCst),
            regions: model.regions.load(Ordering::SeqCst),
            scheduler_suspended: model.suspended.load(Ordering::SeqCst) != 0,
            interrupts_masked: model.masked.load(Ordering::SeqCst),
            stalled: model.stalled.load(Ordering::SeqCst),
        }
    }

    /// Cache enable bit of `cpu`.
    pub fn cache_enabled(&self, cpu: Cpu) -> bool {
        self.snapshot(cpu).cache_enabled
    }

    /// Returns `true` if no core has its cache enabled.
    pub fn all_caches_disabled(&self) -> bool {
        Cpu::all(self.cores).all(|cpu| !self.cache_enabled(cpu))
    }

    /// Returns `true` if `cpu` has its scheduler suspended.
    pub fn scheduler_suspended(&self, cpu: Cpu) -> bool {
        self.snapshot(cpu).scheduler_suspended
    }

    /// Returns `true` if `cpu` has non-IRAM interrupts masked.
    pub fn interrupts_masked(&self, cpu: Cpu) -> bool {
        self.snapshot(cpu).interrupts_masked
    }

    /// Returns `true` if `cpu` is stalled.
    pub fn is_stalled(&self, cpu: Cpu) -> bool {
        self.snapshot(cpu).stalled
    }

    /// Number of times a cache was disabled while a transaction was still in
    /// flight.
    pub fn unsafe_disables(&self) -> u32 {
        self.unsafe_disables.load(Ordering::SeqCst)
    }

    fn model(&self, cpu: Cpu) -> &CoreModel {
        &self.core[cpu.index()]
    }

    fn ipc_sender(&self, cpu: Cpu) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<ParkRequest>>> {
        self.model(cpu)
            .ipc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl CoreIdentity for EmulatedSmp {
    fn current_core(&self) -> Cpu {
        CURRENT_CORE.get()
    }

    fn core_count(&self) -> usize {
        self.cores
    }
}

// Safety: tests only run multiple threads once `start_scheduler` was called.
unsafe impl Scheduler for EmulatedSmp {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn suspend(&self) {
        let cpu = self.current_core();
        let model = self.model(cpu);

        if !IN_IPC_TASK.get() {
            while model.servicing_ipc.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        }

        model.suspended.fetch_add(1, Ordering::SeqCst);
        self.record(Event::SchedulerSuspended(cpu));
    }

    fn resume(&self) {
        let cpu = self.current_core();
        let previous = self.model(cpu).suspended.fetch_sub(1, Ordering::SeqCst);
        assert_ne!(previous, 0, "scheduler of {:?} resumed without suspension", cpu);
        self.record(Event::SchedulerResumed(cpu));
    }

    fn yield_now(&self) {
        thread::yield_now();
    }
}

impl InterProcessorCall for EmulatedSmp {
    fn call_on_core(&self, target: Cpu, request: ParkRequest) -> Result<(), IpcError> {
        if target.index() >= self.cores {
            return Err(IpcError::NoSuchCore);
        }
        if !self.is_started() {
            return Err(IpcError::SchedulerNotRunning);
        }

        let sender = self
            .ipc_sender(target)
            .clone()
            .ok_or(IpcError::SchedulerNotRunning)?;

        self.record(Event::ParkRequested {
            from: self.current_core(),
            to: target,
        });

        sender
            .send(request)
            .map_err(|_| IpcError::SchedulerNotRunning)
    }

    fn on_release(&self, target: Cpu) {
        self.record(Event::Released(target));
    }
}

impl CacheController for EmulatedSmp {
    fn regions(&self, core: Cpu) -> u32 {
        self.model(core).regions.load(Ordering::SeqCst)
    }

    fn set_regions(&self, core: Cpu, regions: u32) {
        self.model(core).regions.store(regions, Ordering::SeqCst);
    }

    fn is_enabled(&self, core: Cpu) -> bool {
        self.model(core).cache_enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, core: Cpu, enabled: bool) {
        let model = self.model(core);

        if enabled {
            model
                .busy_polls
                .store(self.quiescence_polls, Ordering::SeqCst);
            model.cache_enabled.store(true, Ordering::SeqCst);
            self.record(Event::CacheRestored(core));
        } else {
            if model.busy_polls.load(Ordering::SeqCst) != 0 {
                self.unsafe_disables.fetch_add(1, Ordering::SeqCst);
            }
            model.cache_enabled.store(false, Ordering::SeqCst);
            self.record(Event::CacheDisabled(core));
        }
    }

    fn is_quiescent(&self, core: Cpu) -> bool {
        self.model(core)
            .busy_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |polls| {
                polls.checked_sub(1)
            })
            .is_err()
    }
}

impl InterruptControl for EmulatedSmp {
    fn disable_non_iram(&self, core: Cpu) {
        self.model(core).masked.store(true, Ordering::SeqCst);
        self.record(Event::InterruptsMasked(core));
    }

    fn enable_non_iram(&self, core: Cpu) {
        self.model(core).masked.store(false, Ordering::SeqCst);
        self.record(Event::InterruptsUnmasked(core));
    }
}

impl CpuStall for EmulatedSmp {
    unsafe fn stall(&self, core: Cpu) {
        debug_assert_ne!(core, self.current_core(), "a core cannot stall itself");
        self.model(core).stalled.store(true, Ordering::SeqCst);
        self.record(Event::Stalled(core));
    }

    fn unstall(&self, core: Cpu) {
        self.model(core).stalled.store(false, Ordering::SeqCst);
        self.record(Event::Unstalled(core));
    }
}

/// Running IPC tasks, see [`EmulatedSmp::spawn_ipc_tasks`].
pub struct IpcTasks {
    guard: Arc<FlashGuardContext<EmulatedSmp>>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for IpcTasks {
    fn drop(&mut self) {
        let port = self.guard.port();
        for cpu in Cpu::all(port.cores) {
            port.ipc_sender(cpu).take();
        }

        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                // Don't turn an unwinding test into an abort.
                if !thread::panicking() {
                    panic::resume_unwind(payload);
                }
            }
        }
    }
}

/// Waits until `condition` holds, panicking after five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
