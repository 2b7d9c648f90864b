//! # Cache disable/restore
//!
//! Makes the cache state of a core opaque and reversible. Every call to
//! [`disable_cache`] must be matched by exactly one call to [`restore_cache`]
//! with the value it returned. There is no nesting depth.

use crate::port::{CacheController, Cpu};

/// Cache configuration of one core, captured by [`disable_cache`].
///
/// The value belongs to the core it was captured on and is consumed by
/// [`restore_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[must_use = "the cache stays disabled until this state is restored"]
pub struct CacheState {
    regions: u32,
    enabled: bool,
}

impl CacheState {
    /// The region mask that was active before the cache was disabled.
    pub fn regions(&self) -> u32 {
        self.regions
    }

    /// Whether the cache was enabled before it was disabled.
    pub fn was_enabled(&self) -> bool {
        self.enabled
    }
}

/// Disables the cache of `core` and returns what it has to be restored to.
///
/// New fills are stopped by clearing the region mask first, then the cache is
/// given time to finish whatever transaction is in flight. The enable bit is
/// only cleared once the cache is quiescent.
pub fn disable_cache(ctrl: &impl CacheController, core: Cpu) -> CacheState {
    let state = CacheState {
        regions: ctrl.regions(core),
        enabled: ctrl.is_enabled(core),
    };

    ctrl.set_regions(core, 0);
    while !ctrl.is_quiescent(core) {
        core::hint::spin_loop();
    }
    ctrl.set_enabled(core, false);

    state
}

/// Restores the cache of `core` to `state`.
///
/// The mask must be in place before the enable bit is set, otherwise the cache
/// would briefly serve accesses with the wrong configuration.
pub fn restore_cache(ctrl: &impl CacheController, core: Cpu, state: CacheState) {
    ctrl.set_regions(core, state.regions);
    if state.enabled {
        ctrl.set_enabled(core, true);
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        SetRegions(u32),
        Enable(bool),
        Poll(bool),
    }

    struct FakeCache {
        regions: Cell<u32>,
        enabled: Cell<bool>,
        busy_polls: Cell<u32>,
        ops: RefCell<Vec<Op>>,
    }

    impl FakeCache {
        fn new(regions: u32, enabled: bool, busy_polls: u32) -> Self {
            Self {
                regions: Cell::new(regions),
                enabled: Cell::new(enabled),
                busy_polls: Cell::new(busy_polls),
                ops: RefCell::new(Vec::new()),
            }
        }
    }

    impl CacheController for FakeCache {
        fn regions(&self, _core: Cpu) -> u32 {
            self.regions.get()
        }

        fn set_regions(&self, _core: Cpu, regions: u32) {
            self.ops.borrow_mut().push(Op::SetRegions(regions));
            self.regions.set(regions);
        }

        fn is_enabled(&self, _core: Cpu) -> bool {
            self.enabled.get()
        }

        fn set_enabled(&self, _core: Cpu, enabled: bool) {
            self.ops.borrow_mut().push(Op::Enable(enabled));
            self.enabled.set(enabled);
        }

        fn is_quiescent(&self, _core: Cpu) -> bool {
            let busy = self.busy_polls.get();
            self.busy_polls.set(busy.saturating_sub(1));
            self.ops.borrow_mut().push(Op::Poll(busy == 0));
            busy == 0
        }
    }

    #[test]
    fn disable_waits_for_quiescence() {
        let cache = FakeCache::new(0b11, true, 2);

        let state = disable_cache(&cache, Cpu::ProCpu);

        assert_eq!(state.regions(), 0b11);
        assert!(state.was_enabled());
        assert!(!cache.enabled.get());
        assert_eq!(
            *cache.ops.borrow(),
            [
                Op::SetRegions(0),
                Op::Poll(false),
                Op::Poll(false),
                Op::Poll(true),
                Op::Enable(false),
            ]
        );

        restore_cache(&cache, Cpu::ProCpu, state);
    }

    #[test]
    fn restore_applies_mask_before_enable() {
        let cache = FakeCache::new(0b101, true, 0);

        let state = disable_cache(&cache, Cpu::AppCpu);
        cache.ops.borrow_mut().clear();
        restore_cache(&cache, Cpu::AppCpu, state);

        assert_eq!(*cache.ops.borrow(), [Op::SetRegions(0b101), Op::Enable(true)]);
        assert_eq!(cache.regions.get(), 0b101);
        assert!(cache.enabled.get());
    }

    #[test]
    fn restore_keeps_a_disabled_cache_disabled() {
        let cache = FakeCache::new(0b1, false, 0);

        let state = disable_cache(&cache, Cpu::ProCpu);
        restore_cache(&cache, Cpu::ProCpu, state);

        assert!(!cache.enabled.get());
        assert_eq!(cache.regions.get(), 0b1);
    }
}
