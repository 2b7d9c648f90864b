//! # Cross-core rendezvous
//!
//! Parks every core other than the initiator for the duration of a flash
//! window. A parked core runs [`Rendezvous::park_current`] from its IPC task:
//! it suspends its scheduler, disables its own cache, reports readiness and
//! spins until the initiator releases it.
//!
//! Each core has one [`RendezvousSignal`], used while that core is parked:
//!
//! | flag       | set by                 | cleared by                       |
//! |------------|------------------------|----------------------------------|
//! | `ready`    | parked core            | initiator, before the request    |
//! | `complete` | initiator              | parked core, before `ready`      |
//!
//! `complete` is cleared on the parked core: if the initiator cleared it for
//! the next window, a parked core that has not yet seen the previous release
//! would spin forever, with the next park request queued behind it.

use portable_atomic::{AtomicBool, AtomicU8, Ordering};

use crate::{
    cache::{disable_cache, restore_cache},
    port::{Cpu, ParkRequest, Port},
};

/// A set of cores.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct CoreSet(u8);

impl CoreSet {
    pub(crate) const fn empty() -> Self {
        Self(0)
    }

    pub(crate) fn insert(&mut self, cpu: Cpu) {
        self.0 |= 1 << cpu.index();
    }

    pub(crate) fn contains(self, cpu: Cpu) -> bool {
        self.0 & (1 << cpu.index()) != 0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn iter(self) -> impl Iterator<Item = Cpu> {
        Cpu::all(Cpu::COUNT).filter(move |cpu| self.contains(*cpu))
    }
}

/// Handshake flags of one parked core.
pub(crate) struct RendezvousSignal {
    ready: AtomicBool,
    complete: AtomicBool,
}

impl RendezvousSignal {
    const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        }
    }

    /// Initiator: forget the previous window before sending a park request.
    fn arm(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Initiator: spin until the parked core has disabled its cache.
    fn wait_ready(&self) {
        while !self.ready.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    /// Initiator: let the parked core go.
    fn release(&self) {
        self.complete.store(true, Ordering::Release);
    }

    /// Parked core: report that the cache is off.
    fn signal_ready(&self) {
        self.complete.store(false, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
    }

    /// Parked core: spin until the initiator closes the window.
    fn wait_complete(&self) {
        while !self.complete.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

pub(crate) struct Rendezvous {
    signals: [RendezvousSignal; Cpu::COUNT],
    // Initiator of the window the parked cores are waiting in. Diagnostic only.
    initiator: AtomicU8,
}

impl Rendezvous {
    const NO_INITIATOR: u8 = u8::MAX;

    pub(crate) const fn new() -> Self {
        Self {
            signals: [const { RendezvousSignal::new() }; Cpu::COUNT],
            initiator: AtomicU8::new(Self::NO_INITIATOR),
        }
    }

    fn signal(&self, cpu: Cpu) -> &RendezvousSignal {
        &self.signals[cpu.index()]
    }

    /// Parks every core except `initiator` and returns once all of them have
    /// disabled their caches.
    ///
    /// The scheduler must be running on every target core.
    pub(crate) fn park_others(&self, port: &impl Port, initiator: Cpu) -> CoreSet {
        let mut parked = CoreSet::empty();

        self.initiator.store(initiator as u8, Ordering::Relaxed);

        for other in initiator.others(port.core_count()) {
            self.signal(other).arm();
            if let Err(error) = port.call_on_core(other, ParkRequest::Park { initiator }) {
                panic!("Failed to park {:?} for a flash operation: {:?}", other, error);
            }
            parked.insert(other);
        }

        for other in parked.iter() {
            self.signal(other).wait_ready();
        }

        parked
    }

    /// Releases the cores returned by [`Rendezvous::park_others`].
    pub(crate) fn unpark(&self, port: &impl Port, parked: CoreSet) {
        self.initiator.store(Self::NO_INITIATOR, Ordering::Relaxed);

        for other in parked.iter() {
            port.on_release(other);
            self.signal(other).release();
        }
    }

    /// The park function. Runs on the target core, from its IPC task.
    ///
    /// Nothing in here may execute from flash between disabling and
    /// restoring the cache, which includes logging.
    pub(crate) fn park_current(&self, port: &impl Port, initiator: Cpu) {
        let current = port.current_core();
        debug_assert_ne!(current, initiator, "park request delivered to the initiator");

        trace!("Parking {:?} for a flash operation on {:?}", current, initiator);

        let signal = self.signal(current);

        port.suspend();
        port.disable_non_iram(current);
        let cache = disable_cache(port, current);

        signal.signal_ready();
        signal.wait_complete();

        restore_cache(port, current, cache);
        port.enable_non_iram(current);
        port.resume();

        trace!("Unparked {:?}", current);
    }

    /// Core that currently keeps other cores parked, if any.
    pub(crate) fn initiator(&self) -> Option<Cpu> {
        Cpu::from_repr(self.initiator.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn core_set() {
        let mut set = CoreSet::empty();
        assert!(set.is_empty());

        set.insert(Cpu::AppCpu);
        assert!(set.contains(Cpu::AppCpu));
        assert!(!set.contains(Cpu::ProCpu));
        assert_eq!(set.iter().collect::<Vec<_>>(), [Cpu::AppCpu].to_vec());
    }

    #[test]
    fn parked_side_clears_completion_before_ready() {
        let signal = Arc::new(RendezvousSignal::new());

        // A release left over from a previous window.
        signal.release();
        signal.arm();

        let parked = {
            let signal = signal.clone();
            thread::spawn(move || {
                signal.signal_ready();
                signal.wait_complete();
            })
        };

        signal.wait_ready();
        thread::sleep(Duration::from_millis(10));
        assert!(!parked.is_finished());

        signal.release();
        parked.join().unwrap();
    }
}
