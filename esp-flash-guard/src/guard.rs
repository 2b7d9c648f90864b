//! # Flash operation guard
//!
//! ## Overview
//!
//! Every routine that erases, programs or reads the SPI flash brackets its
//! work with [`FlashGuardContext::start`] and [`FlashGuardContext::end`], or
//! with one of the scoped helpers built on them. Between the two calls no
//! core fetches code or data through its cache, and no other flash
//! operation is in progress anywhere in the system.
//!
//! A window in [`GuardMode::Scheduler`] (the default) goes through these
//! steps, and `end` undoes them in reverse order:
//!
//! 1. Take the [`OperationLock`].
//! 2. Park every other core:
//!    - scheduler running: send a [`ParkRequest`] and wait until the target
//!      reports its cache is off,
//!    - scheduler not started: disable the other core's cache directly.
//! 3. Suspend the local scheduler and mask non-IRAM interrupts.
//! 4. Disable the local cache.
//!
//! [`GuardMode::NoOs`] is meant for code that cannot rely on the scheduler or
//! the IPC tasks, like a panic handler: no lock is taken, other cores are
//! stalled and every cache is disabled by the initiator.
//!
//! Windows do not nest. Opening a window on a core that already has one open
//! panics before any state is touched, so the open window still closes
//! normally. Windows in [`GuardMode::NoOs`] opened on different cores are
//! serialized by a flag of their own.
//!
//! None of the waits involved have a timeout. A core that never answers a
//! park request hangs the initiator until a watchdog resets the chip.
//!
//! ## Examples
//!
//! ```rust, ignore
//! let guard = FlashGuardContext::new(port);
//!
//! let rc = guard.run(|| unsafe { esp_rom_spiflash_erase_sector(sector) });
//! ```

use core::{cell::UnsafeCell, marker::PhantomData};

use portable_atomic::{AtomicBool, Ordering};

use crate::{
    cache::{CacheState, disable_cache, restore_cache},
    lock::{LockToken, OperationLock},
    port::{Cpu, ParkRequest, Port},
    rendezvous::{CoreSet, Rendezvous},
};

/// How a flash window keeps the other cores away from flash.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GuardMode {
    /// Serialize through the operation lock and park other cores through
    /// their IPC task. Falls back to direct cache control before the
    /// scheduler has started.
    #[default]
    Scheduler,
    /// Stall other cores and disable every cache directly, without taking
    /// the operation lock.
    NoOs,
}

// Bookkeeping of an open window. Written by the initiator in `start`,
// consumed by the same initiator in `end`.
struct Window {
    mode: GuardMode,
    initiator: Cpu,
    lock: LockToken,
    cache: CacheState,
    // Caches of other cores disabled by the initiator itself.
    direct: [Option<CacheState>; Cpu::COUNT],
    parked: CoreSet,
    stalled: CoreSet,
    scheduler_suspended: bool,
}

/// Process-wide state of the flash guard.
///
/// Owned by whichever module brings up the flash subsystem and shared by
/// reference with every flash routine and with the platform's IPC tasks.
pub struct FlashGuardContext<P: Port> {
    port: P,
    lock: OperationLock,
    rendezvous: Rendezvous,
    // Set while a `GuardMode::NoOs` window is open on any core.
    no_os_busy: AtomicBool,
    // Indexed by the initiator's core.
    windows: [UnsafeCell<Option<Window>>; Cpu::COUNT],
}

// Safety: a slot of `windows` is only accessed from its own core, by the task
// that opens or closes a window there. That task cannot be preempted by
// another flash routine on the same core while the window is open.
unsafe impl<P: Port + Sync> Sync for FlashGuardContext<P> {}

impl<P: Port> FlashGuardContext<P> {
    /// Creates the guard state for the given platform.
    pub const fn new(port: P) -> Self {
        Self {
            port,
            lock: OperationLock::new(),
            rendezvous: Rendezvous::new(),
            no_os_busy: AtomicBool::new(false),
            windows: [const { UnsafeCell::new(None) }; Cpu::COUNT],
        }
    }

    /// The platform this guard runs on.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The lock serializing flash windows.
    pub fn operation_lock(&self) -> &OperationLock {
        &self.lock
    }

    /// Returns `true` if the cache of the calling core is enabled, i.e. if
    /// the caller is not inside a flash window.
    pub fn is_cache_enabled(&self) -> bool {
        self.port.is_enabled(self.port.current_core())
    }

    /// Opens a flash window in [`GuardMode::Scheduler`].
    ///
    /// Returns once no core can access flash through its cache.
    ///
    /// # Safety
    ///
    /// - Every call must be followed by exactly one call to
    ///   [`FlashGuardContext::end`] on the same core, also when the flash
    ///   operation failed.
    /// - Until `end`, the caller must not execute code or access data that
    ///   lives in flash or external RAM.
    pub unsafe fn start(&self) {
        unsafe { self.start_with(GuardMode::Scheduler) }
    }

    /// Opens a flash window in [`GuardMode::NoOs`].
    ///
    /// # Safety
    ///
    /// The same rules as for [`FlashGuardContext::start`] apply.
    pub unsafe fn start_no_os(&self) {
        unsafe { self.start_with(GuardMode::NoOs) }
    }

    /// Opens a flash window in the given mode.
    ///
    /// # Panics
    ///
    /// Panics if the calling core already has a window open.
    ///
    /// # Safety
    ///
    /// The same rules as for [`FlashGuardContext::start`] apply.
    pub unsafe fn start_with(&self, mode: GuardMode) {
        let core = self.port.current_core();
        if unsafe { (*self.slot(core)).is_some() } {
            panic!("Flash window opened on {:?} while one is already open", core);
        }

        let window = match mode {
            GuardMode::Scheduler => self.open_scheduler_window(),
            GuardMode::NoOs => unsafe { self.open_no_os_window() },
        };

        let slot = self.slot(window.initiator);
        unsafe { *slot = Some(window) };
    }

    /// Closes the window opened by the matching `start` call.
    ///
    /// # Safety
    ///
    /// Must be called on the core that opened the window, exactly once per
    /// window.
    pub unsafe fn end(&self) {
        let core = self.port.current_core();
        let Some(window) = (unsafe { (*self.slot(core)).take() }) else {
            debug_assert!(false, "flash window closed without being opened");
            return;
        };

        let port = &self.port;
        let initiator = window.initiator;

        restore_cache(port, initiator, window.cache);
        for cpu in initiator.others(Cpu::COUNT) {
            if let Some(state) = window.direct[cpu.index()] {
                restore_cache(port, cpu, state);
            }
        }

        port.enable_non_iram(initiator);

        // Only now, with the local cache back on, may parked cores continue.
        self.rendezvous.unpark(port, window.parked);
        for cpu in window.stalled.iter() {
            port.unstall(cpu);
        }

        if window.scheduler_suspended {
            port.resume();
        }

        unsafe { self.lock.release(window.lock) };
        if window.mode == GuardMode::NoOs {
            self.no_os_busy.store(false, Ordering::Release);
        }

        trace!(
            "Flash window on {:?} closed ({:?}, parked: {})",
            initiator,
            window.mode,
            !window.parked.is_empty()
        );
    }

    /// Opens a flash window in [`GuardMode::Scheduler`] that is closed when
    /// the returned guard is dropped.
    ///
    /// # Safety
    ///
    /// The guard must be dropped. A leaked guard keeps the window open for
    /// good, with the operation lock held and the other cores parked.
    pub unsafe fn enter(&self) -> FlashOpGuard<'_, P> {
        unsafe { self.enter_with(GuardMode::Scheduler) }
    }

    /// Opens a flash window in the given mode that is closed when the
    /// returned guard is dropped.
    ///
    /// # Safety
    ///
    /// The same rules as for [`FlashGuardContext::enter`] apply.
    pub unsafe fn enter_with(&self, mode: GuardMode) -> FlashOpGuard<'_, P> {
        unsafe { self.start_with(mode) };

        FlashOpGuard {
            context: self,
            _not_send: PhantomData,
        }
    }

    /// Runs the callback inside a flash window in [`GuardMode::Scheduler`].
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        self.run_with(GuardMode::Scheduler, f)
    }

    /// Runs the callback inside a flash window in [`GuardMode::NoOs`].
    pub fn run_no_os<R>(&self, f: impl FnOnce() -> R) -> R {
        self.run_with(GuardMode::NoOs, f)
    }

    /// Runs the callback inside a flash window in the given mode.
    ///
    /// The window is closed whether or not the operation succeeded. On
    /// hardware, the callback and everything it calls must be placed in RAM.
    ///
    /// # Panics
    ///
    /// Panics if the calling core already has a window open, e.g. when
    /// called from inside the callback of another `run`.
    pub fn run_with<R>(&self, mode: GuardMode, f: impl FnOnce() -> R) -> R {
        // Safety: the guard never leaves this scope.
        let _guard = unsafe { self.enter_with(mode) };
        f()
    }

    /// Runs the callback with only the operation lock held.
    ///
    /// For flash accesses that do not require the caches to be disabled but
    /// must not interleave with other flash operations.
    pub fn with_operation_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.lock(&self.port, f)
    }

    /// Services a request sent by [`InterProcessorCall::call_on_core`].
    ///
    /// The platform's IPC task calls this on the target core.
    ///
    /// [`InterProcessorCall::call_on_core`]: crate::InterProcessorCall::call_on_core
    pub fn handle_ipc(&self, request: ParkRequest) {
        match request {
            ParkRequest::Park { initiator } => {
                debug_assert_eq!(self.rendezvous.initiator(), Some(initiator));
                self.rendezvous.park_current(&self.port, initiator);
            }
        }
    }

    fn slot(&self, core: Cpu) -> *mut Option<Window> {
        self.windows[core.index()].get()
    }

    fn open_scheduler_window(&self) -> Window {
        let port = &self.port;

        // The scheduler state is sampled once. The lock is only taken when
        // the scheduler runs, and `end` relies on the same decision.
        let lock = self.lock.acquire(port);
        let scheduler_running = lock.is_held();
        let initiator = port.current_core();
        let cores = port.core_count();

        trace!("Opening flash window on {:?}", initiator);

        let mut parked = CoreSet::empty();
        let mut direct = [None; Cpu::COUNT];

        if scheduler_running {
            parked = self.rendezvous.park_others(port, initiator);
            port.suspend();
            debug_assert_eq!(
                port.current_core(),
                initiator,
                "task migrated while opening a flash window"
            );
        } else if cores > 1 {
            // The other cores are held in reset or spin in IRAM, they cannot
            // race with us.
            debug!("Scheduler not started, disabling other caches directly");
            for other in initiator.others(cores) {
                direct[other.index()] = Some(disable_cache(port, other));
            }
        }

        port.disable_non_iram(initiator);
        let cache = disable_cache(port, initiator);

        Window {
            mode: GuardMode::Scheduler,
            initiator,
            lock,
            cache,
            direct,
            parked,
            stalled: CoreSet::empty(),
            scheduler_suspended: scheduler_running,
        }
    }

    unsafe fn open_no_os_window(&self) -> Window {
        let port = &self.port;

        // Another core may be in the middle of its own window. It unstalls us
        // before it lets go of the flag.
        while self
            .no_os_busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        let initiator = port.current_core();
        let cores = port.core_count();

        trace!("Opening flash window on {:?} without scheduler", initiator);

        let mut stalled = CoreSet::empty();
        for other in initiator.others(cores) {
            unsafe { port.stall(other) };
            stalled.insert(other);
        }

        port.disable_non_iram(initiator);

        let mut direct = [None; Cpu::COUNT];
        for other in stalled.iter() {
            direct[other.index()] = Some(disable_cache(port, other));
        }
        let cache = disable_cache(port, initiator);

        Window {
            mode: GuardMode::NoOs,
            initiator,
            lock: LockToken::bypassed(),
            cache,
            direct,
            parked: CoreSet::empty(),
            stalled,
            scheduler_suspended: false,
        }
    }
}

/// An open flash window, closed when dropped.
#[must_use = "dropping the guard closes the flash window immediately"]
pub struct FlashOpGuard<'a, P: Port> {
    context: &'a FlashGuardContext<P>,
    // The window must be closed on the core that opened it.
    _not_send: PhantomData<*const ()>,
}

impl<P: Port> Drop for FlashOpGuard<'_, P> {
    fn drop(&mut self) {
        unsafe { self.context.end() };
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            Arc,
            Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::emulation::{EmulatedSmp, Event, wait_until};

    fn position(events: &[Event], event: Event) -> usize {
        events
            .iter()
            .position(|e| *e == event)
            .unwrap_or_else(|| panic!("{event:?} not recorded in {events:?}"))
    }

    #[test]
    fn single_core_window() {
        let guard = FlashGuardContext::new(EmulatedSmp::new(1));
        let port = guard.port();
        port.start_scheduler();
        let before = port.snapshot(Cpu::ProCpu);

        guard.run(|| {
            assert!(port.scheduler_suspended(Cpu::ProCpu));
            assert!(!port.cache_enabled(Cpu::ProCpu));
            assert!(port.interrupts_masked(Cpu::ProCpu));
            assert_eq!(guard.operation_lock().holders(), 1);
        });

        assert!(!port.scheduler_suspended(Cpu::ProCpu));
        assert!(!port.interrupts_masked(Cpu::ProCpu));
        assert!(guard.is_cache_enabled());
        assert_eq!(guard.operation_lock().holders(), 0);
        assert_eq!(port.snapshot(Cpu::ProCpu), before);
        assert!(
            !port
                .events()
                .iter()
                .any(|e| matches!(e, Event::ParkRequested { .. }))
        );
    }

    #[test]
    fn single_core_before_scheduler_start() {
        let guard = FlashGuardContext::new(EmulatedSmp::new(1));
        let port = guard.port();

        guard.run(|| {
            assert!(!port.cache_enabled(Cpu::ProCpu));
            assert!(!port.scheduler_suspended(Cpu::ProCpu));
            assert_eq!(guard.operation_lock().holders(), 0);
        });

        assert!(guard.is_cache_enabled());
        assert_eq!(guard.operation_lock().holders(), 0);
    }

    #[test]
    fn dual_core_before_scheduler_start_disables_other_cache() {
        let guard = FlashGuardContext::new(EmulatedSmp::new(2));
        let port = guard.port();
        let before = [port.snapshot(Cpu::ProCpu), port.snapshot(Cpu::AppCpu)];

        guard.run(|| {
            assert!(port.all_caches_disabled());
            assert!(!port.scheduler_suspended(Cpu::AppCpu));
        });

        let events = port.events();
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, Event::ParkRequested { .. }))
        );
        assert!(
            position(&events, Event::CacheDisabled(Cpu::AppCpu))
                < position(&events, Event::CacheDisabled(Cpu::ProCpu))
        );
        assert_eq!(
            [port.snapshot(Cpu::ProCpu), port.snapshot(Cpu::AppCpu)],
            before
        );
    }

    #[test]
    fn dual_core_window() {
        let guard = Arc::new(FlashGuardContext::new(
            EmulatedSmp::new(2).with_quiescence_polls(3),
        ));
        let _ipc = EmulatedSmp::spawn_ipc_tasks(&guard);
        let port = guard.port();
        port.start_scheduler();
        EmulatedSmp::bind_current_thread(Cpu::ProCpu);

        let before = [port.snapshot(Cpu::ProCpu), port.snapshot(Cpu::AppCpu)];

        guard.run(|| {
            assert!(port.all_caches_disabled());
            assert!(port.scheduler_suspended(Cpu::AppCpu));
            port.mark("flash");
            thread::sleep(Duration::from_millis(20));
            // The parked core is still spinning.
            assert!(!port.cache_enabled(Cpu::AppCpu));
            port.mark("flash done");
        });

        wait_until(|| !port.scheduler_suspended(Cpu::AppCpu));

        let events = port.events();
        let app_disabled = position(&events, Event::CacheDisabled(Cpu::AppCpu));
        let pro_disabled = position(&events, Event::CacheDisabled(Cpu::ProCpu));
        let flash = position(&events, Event::Marker(Cpu::ProCpu, "flash"));
        let flash_done = position(&events, Event::Marker(Cpu::ProCpu, "flash done"));
        let pro_restored = position(&events, Event::CacheRestored(Cpu::ProCpu));
        let released = position(&events, Event::Released(Cpu::AppCpu));
        let app_restored = position(&events, Event::CacheRestored(Cpu::AppCpu));

        assert!(app_disabled < pro_disabled);
        assert!(pro_disabled < flash);
        assert!(flash_done < pro_restored);
        // The parked core is only released once the initiator's cache is back.
        assert!(pro_restored < released);
        assert!(released < app_restored);

        assert_eq!(port.unsafe_disables(), 0);
        assert_eq!(
            [port.snapshot(Cpu::ProCpu), port.snapshot(Cpu::AppCpu)],
            before
        );
        assert_eq!(guard.operation_lock().holders(), 0);
    }

    #[test]
    fn ready_is_only_observed_after_target_cache_is_off() {
        let guard = Arc::new(FlashGuardContext::new(
            EmulatedSmp::new(2)
                .with_quiescence_polls(50)
                .with_ipc_delay(Duration::from_millis(10)),
        ));
        let _ipc = EmulatedSmp::spawn_ipc_tasks(&guard);
        let port = guard.port();
        port.start_scheduler();
        EmulatedSmp::bind_current_thread(Cpu::ProCpu);

        for _ in 0..5 {
            unsafe { guard.start() };
            // `start` returned, so `ready` was seen.
            assert!(!port.cache_enabled(Cpu::AppCpu));
            assert!(port.scheduler_suspended(Cpu::AppCpu));
            unsafe { guard.end() };
            wait_until(|| !port.scheduler_suspended(Cpu::AppCpu));
        }

        assert_eq!(port.unsafe_disables(), 0);
    }

    #[test]
    fn windows_never_overlap() {
        let guard = Arc::new(FlashGuardContext::new(EmulatedSmp::new(2)));
        let _ipc = EmulatedSmp::spawn_ipc_tasks(&guard);
        guard.port().start_scheduler();

        let open = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = [Cpu::ProCpu, Cpu::AppCpu]
            .into_iter()
            .map(|cpu| {
                let guard = guard.clone();
                let open = open.clone();
                let violations = violations.clone();
                EmulatedSmp::on_core(cpu, move || {
                    for _ in 0..25 {
                        guard.run(|| {
                            if open.fetch_add(1, Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            if !guard.port().all_caches_disabled() {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(200));
                            open.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(guard.operation_lock().holders(), 0);
    }

    #[test]
    fn second_window_waits_for_first() {
        let guard = Arc::new(FlashGuardContext::new(EmulatedSmp::new(2)));
        let _ipc = EmulatedSmp::spawn_ipc_tasks(&guard);
        guard.port().start_scheduler();

        let first_inside = Arc::new(Barrier::new(2));

        let first = {
            let guard = guard.clone();
            let first_inside = first_inside.clone();
            EmulatedSmp::on_core(Cpu::ProCpu, move || {
                guard.run(|| {
                    guard.port().mark("first enter");
                    first_inside.wait();
                    thread::sleep(Duration::from_millis(30));
                    guard.port().mark("first exit");
                });
            })
        };

        let second = {
            let guard = guard.clone();
            EmulatedSmp::on_core(Cpu::AppCpu, move || {
                first_inside.wait();
                guard.port().mark("second start");
                guard.run(|| guard.port().mark("second enter"));
            })
        };

        first.join().unwrap();
        second.join().unwrap();

        let events = guard.port().events();
        let start = position(&events, Event::Marker(Cpu::AppCpu, "second start"));
        let first_exit = position(&events, Event::Marker(Cpu::ProCpu, "first exit"));
        let second_enter = position(&events, Event::Marker(Cpu::AppCpu, "second enter"));

        assert!(start < first_exit);
        assert!(first_exit < second_enter);
        // The second window was opened after the first one was fully closed.
        let first_resumed = position(&events, Event::SchedulerResumed(Cpu::ProCpu));
        assert!(first_resumed < second_enter);
    }

    #[test]
    fn window_is_closed_when_operation_fails() {
        let guard = FlashGuardContext::new(EmulatedSmp::new(1));
        guard.port().start_scheduler();

        let result: Result<(), i32> = guard.run(|| Err(2));

        assert_eq!(result, Err(2));
        assert!(guard.is_cache_enabled());
        assert!(!guard.port().scheduler_suspended(Cpu::ProCpu));
        assert_eq!(guard.operation_lock().holders(), 0);
    }

    #[test]
    fn no_os_window_stalls_other_core() {
        let guard = FlashGuardContext::new(EmulatedSmp::new(2));
        let port = guard.port();
        port.start_scheduler();
        EmulatedSmp::bind_current_thread(Cpu::ProCpu);
        let before = [port.snapshot(Cpu::ProCpu), port.snapshot(Cpu::AppCpu)];

        guard.run_no_os(|| {
            assert!(port.is_stalled(Cpu::AppCpu));
            assert!(port.all_caches_disabled());
            assert_eq!(guard.operation_lock().holders(), 0);
            assert!(!port.scheduler_suspended(Cpu::ProCpu));
        });

        let events = port.events();
        assert!(
            position(&events, Event::Stalled(Cpu::AppCpu))
                < position(&events, Event::CacheDisabled(Cpu::AppCpu))
        );
        assert!(
            position(&events, Event::CacheRestored(Cpu::AppCpu))
                < position(&events, Event::Unstalled(Cpu::AppCpu))
        );
        assert!(!port.is_stalled(Cpu::AppCpu));
        assert_eq!(
            [port.snapshot(Cpu::ProCpu), port.snapshot(Cpu::AppCpu)],
            before
        );
    }

    #[test]
    #[should_panic(expected = "Failed to park")]
    fn failed_park_request_panics() {
        // Scheduler running, but no IPC task to deliver the request to.
        let guard = FlashGuardContext::new(EmulatedSmp::new(2));
        guard.port().start_scheduler();
        EmulatedSmp::bind_current_thread(Cpu::ProCpu);

        guard.run(|| ());
    }

    #[test]
    fn nested_window_panics_and_outer_window_still_closes() {
        for (started, mode) in [
            (false, GuardMode::Scheduler),
            (true, GuardMode::Scheduler),
            (false, GuardMode::NoOs),
        ] {
            let guard = FlashGuardContext::new(EmulatedSmp::new(1));
            let port = guard.port();
            if started {
                port.start_scheduler();
            }
            let before = port.snapshot(Cpu::ProCpu);

            let nested = panic::catch_unwind(AssertUnwindSafe(|| {
                guard.run_with(mode, || guard.run_with(mode, || ()))
            }));

            assert!(nested.is_err(), "{mode:?}");
            assert!(guard.is_cache_enabled(), "{mode:?}");
            assert_eq!(port.snapshot(Cpu::ProCpu), before);
            assert_eq!(guard.operation_lock().holders(), 0);

            // The guard is still usable.
            guard.run_with(mode, || assert!(!guard.is_cache_enabled()));
            assert!(guard.is_cache_enabled());
        }
    }

    #[test]
    fn no_os_windows_from_both_cores_are_serialized() {
        let guard = Arc::new(FlashGuardContext::new(EmulatedSmp::new(2)));
        guard.port().start_scheduler();

        let open = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = [Cpu::ProCpu, Cpu::AppCpu]
            .into_iter()
            .map(|cpu| {
                let guard = guard.clone();
                let open = open.clone();
                let violations = violations.clone();
                EmulatedSmp::on_core(cpu, move || {
                    for _ in 0..25 {
                        guard.run_no_os(|| {
                            if open.fetch_add(1, Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            let stalled = cpu.others(2).all(|other| guard.port().is_stalled(other));
                            if !guard.port().all_caches_disabled() || !stalled {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(200));
                            open.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let port = guard.port();
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(!port.is_stalled(Cpu::ProCpu) && !port.is_stalled(Cpu::AppCpu));
        assert!(port.cache_enabled(Cpu::ProCpu) && port.cache_enabled(Cpu::AppCpu));
    }

    #[test]
    fn operation_lock_only() {
        let guard = FlashGuardContext::new(EmulatedSmp::new(2));
        guard.port().start_scheduler();

        guard.with_operation_lock(|| {
            assert_eq!(guard.operation_lock().holders(), 1);
            assert!(guard.is_cache_enabled());
        });

        assert_eq!(guard.operation_lock().holders(), 0);
    }
}
