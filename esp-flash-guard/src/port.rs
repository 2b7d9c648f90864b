//! # Platform interfaces
//!
//! ## Overview
//!
//! The flash guard does not touch any hardware itself. Everything it needs
//! from the chip and from the task runtime is expressed by the traits in this
//! module, which the platform layer implements once:
//!
//! - [`CoreIdentity`]: which core is executing, and how many cores exist.
//! - [`Scheduler`]: suspend/resume preemption on the calling core.
//! - [`InterProcessorCall`]: run a [`ParkRequest`] on a specific core.
//! - [`CacheController`]: per-core cache region mask, enable bit and
//!   quiescence.
//! - [`InterruptControl`]: mask interrupts whose handlers live in flash.
//! - [`CpuStall`]: halt a core from the outside, used when no scheduler is
//!   available.
//!
//! [`Port`] is implemented automatically for any type that implements all of
//! them.

use core::fmt;

/// Available CPU cores
///
/// The number of cores actually present is reported at runtime by
/// [`CoreIdentity::core_count`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Cpu {
    /// The first core
    ProCpu = 0,
    /// The second core
    AppCpu = 1,
}

impl Cpu {
    /// The largest number of cores any supported chip has.
    pub const COUNT: usize = 2;

    /// Index of this core, suitable for per-core arrays.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns an iterator over the first `count` cores.
    #[inline]
    pub fn all(count: usize) -> impl Iterator<Item = Self> {
        (0..count.min(Self::COUNT) as u8).filter_map(Self::from_repr)
    }

    /// Returns an iterator over the first `count` cores, skipping `self`.
    #[inline]
    pub fn others(self, count: usize) -> impl Iterator<Item = Self> {
        Self::all(count).filter(move |cpu| *cpu != self)
    }
}

/// Core identity, provided by the CPU.
pub trait CoreIdentity {
    /// Returns the core the caller is currently executing on.
    fn current_core(&self) -> Cpu;

    /// Returns the number of cores that are present.
    fn core_count(&self) -> usize;
}

/// Task scheduler of the calling core.
///
/// # Safety
///
/// While [`Scheduler::is_started`] returns `false`, at most one core may be
/// executing code that can reach the flash guard. The other cores must be held
/// in reset or spin in code that does not live in flash. The guard relies on
/// this to skip both the operation lock and the rendezvous during early boot.
pub unsafe trait Scheduler {
    /// Returns `true` once the scheduler has been started.
    fn is_started(&self) -> bool;

    /// Prevents preemption of the current task on the calling core.
    ///
    /// Calls are never nested by the flash guard.
    fn suspend(&self);

    /// Allows preemption on the calling core again.
    fn resume(&self);

    /// Gives other tasks a chance to run while waiting for the operation
    /// lock. Only called before any core has been parked.
    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

/// Work that can be sent to another core.
///
/// There is exactly one action in the protocol, but keeping it a closed enum
/// lets the IPC layer dispatch without function pointers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParkRequest {
    /// Park the receiving core until the window opened by `initiator` closes.
    Park {
        /// The core that opened the flash window.
        initiator: Cpu,
    },
}

/// Error returned by [`InterProcessorCall::call_on_core`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum IpcError {
    /// The target core does not exist on this chip.
    NoSuchCore,
    /// The scheduler on the target core is not running, so nothing can
    /// service the request.
    SchedulerNotRunning,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::NoSuchCore => write!(f, "the target core does not exist"),
            IpcError::SchedulerNotRunning => {
                write!(f, "the scheduler is not running on the target core")
            }
        }
    }
}

impl core::error::Error for IpcError {}

/// Inter-processor call.
pub trait InterProcessorCall {
    /// Asynchronously runs `request` on `target` at a priority that preempts
    /// every user task there.
    ///
    /// The platform's IPC task on `target` must hand the request to
    /// [`FlashGuardContext::handle_ipc`](crate::FlashGuardContext::handle_ipc).
    fn call_on_core(&self, target: Cpu, request: ParkRequest) -> Result<(), IpcError>;

    /// Called on the initiator right before a core parked by
    /// [`ParkRequest::Park`] is allowed to continue.
    ///
    /// Runs with the caches of `target` still disabled and must not touch
    /// flash. The default does nothing.
    fn on_release(&self, target: Cpu) {
        let _ = target;
    }
}

/// Raw per-core cache control.
///
/// The guard only uses these through [`disable_cache`](crate::disable_cache)
/// and [`restore_cache`](crate::restore_cache), which take care of ordering.
pub trait CacheController {
    /// Returns the mask of cache regions (MMU pages, ways) currently enabled
    /// on `core`.
    fn regions(&self, core: Cpu) -> u32;

    /// Sets the mask of enabled cache regions on `core`.
    fn set_regions(&self, core: Cpu, regions: u32);

    /// Returns `true` if the cache of `core` is enabled.
    fn is_enabled(&self, core: Cpu) -> bool;

    /// Sets or clears the cache enable bit of `core`.
    fn set_enabled(&self, core: Cpu, enabled: bool);

    /// Returns `true` if no cache fill or writeback is in flight on `core`.
    fn is_quiescent(&self, core: Cpu) -> bool;
}

/// Masking of interrupts whose handlers are not resident in internal RAM.
pub trait InterruptControl {
    /// Masks every interrupt on `core` whose handler may execute from flash.
    fn disable_non_iram(&self, core: Cpu);

    /// Undoes [`InterruptControl::disable_non_iram`].
    fn enable_non_iram(&self, core: Cpu);
}

/// Stalling a core from the outside.
pub trait CpuStall {
    /// Stops `core` from executing instructions.
    ///
    /// # Safety
    ///
    /// `core` must not be the core executing the call.
    unsafe fn stall(&self, core: Cpu);

    /// Lets a stalled `core` continue.
    fn unstall(&self, core: Cpu);
}

/// Everything the flash guard needs from the platform.
pub trait Port:
    CoreIdentity + Scheduler + InterProcessorCall + CacheController + InterruptControl + CpuStall
{
}

impl<T> Port for T where
    T: CoreIdentity
        + Scheduler
        + InterProcessorCall
        + CacheController
        + InterruptControl
        + CpuStall
{
}
