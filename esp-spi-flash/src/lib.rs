//! SPI NOR flash storage for multi-core ESP32 devices
//!
//! [`FlashStorage`] implements the `embedded-storage` traits on top of the
//! ROM flash routines. Every access runs inside a window of an
//! [`esp_flash_guard::FlashGuardContext`], so the other cores are parked and
//! no cache fetches from flash while the chip is busy.
//!
//! ```rust, ignore
//! static GUARD: FlashGuardContext<Platform> = FlashGuardContext::new(Platform);
//!
//! let mut storage = FlashStorage::new(&GUARD, unsafe { RomFlash::steal() }, Config::default())?;
//! storage.erase(0x110000, 0x111000)?;
//! storage.write(0x110000, &data)?;
//! ```
//!
//! ## Feature Flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]
#![doc(html_logo_url = "https://avatars.githubusercontent.com/u/46717278")]
#![deny(missing_docs, rust_2018_idioms)]
#![cfg_attr(not(any(test, feature = "emulation")), no_std)]

// MUST be the first module
mod fmt;

mod buffer;
mod common;
mod nor_flash;
mod storage;

#[cfg(not(any(test, feature = "emulation")))]
mod rom;

#[cfg(any(test, feature = "emulation"))]
pub mod emulation;

pub use common::{Config, DangerousWrites, FlashChip, FlashStorage, FlashStorageError, check_rc};
#[cfg(not(any(test, feature = "emulation")))]
pub use rom::RomFlash;
