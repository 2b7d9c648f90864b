//! Cross-core critical section for SPI flash access on multi-core ESP32
//! devices
//!
//! While the SPI flash is being erased, programmed or read through the ROM
//! routines, the flash cannot serve cache fills. Any core that fetches code or
//! data from flash in that time reads garbage. This crate brackets every flash
//! operation with a window in which:
//!
//! - the calling core cannot be preempted and has its cache disabled,
//! - every other core is parked in internal RAM with its cache disabled,
//! - no other flash operation is in progress.
//!
//! The platform (CPU identification, scheduler, inter-processor calls, cache
//! and interrupt control) is abstracted by the traits in [`port`]. See
//! [`FlashGuardContext`] for the entry points.
//!
//! ## Feature Flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]
#![doc(html_logo_url = "https://avatars.githubusercontent.com/u/46717278")]
#![deny(missing_docs, rust_2018_idioms)]
#![cfg_attr(not(any(test, feature = "emulation")), no_std)]

// MUST be the first module
mod fmt;

mod cache;
mod guard;
mod lock;
pub mod port;
mod rendezvous;

#[cfg(any(test, feature = "emulation"))]
pub mod emulation;

pub use cache::{CacheState, disable_cache, restore_cache};
pub use guard::{FlashGuardContext, FlashOpGuard, GuardMode};
pub use lock::{LockToken, OperationLock};
pub use port::{
    CacheController,
    CoreIdentity,
    Cpu,
    CpuStall,
    InterProcessorCall,
    InterruptControl,
    IpcError,
    ParkRequest,
    Port,
    Scheduler,
};
