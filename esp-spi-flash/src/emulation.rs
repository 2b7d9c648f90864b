//! # In-memory NOR flash
//!
//! [`EmulatedFlash`] implements [`FlashChip`] on a byte array with NOR
//! semantics: erasing sets a sector to `0xff`, programming can only clear
//! bits. Handles are cheap to clone and share the same memory, so tests can
//! inspect the chip after handing it to a [`FlashStorage`](crate::FlashStorage).

use std::{
    boxed::Box,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    vec,
    vec::Vec,
};

use crate::{
    FlashChip,
    common::{ENCRYPTED_WRITE_SIZE, SECTOR_SIZE, WORD_SIZE},
};

const SUCCESS_CODE: i32 = 0;
const ERROR_CODE: i32 = 1;
const ERASE_BYTE: u8 = 0xff;
const ENCRYPTION_KEY: u8 = 0x5a;

macro_rules! print_error {
    ($($tt:tt)*) => {
        #[cfg(test)]
        std::eprintln!($($tt)*)
    };
}

type AccessCheck = Box<dyn Fn() -> bool + Send + Sync>;

struct Chip {
    data: Vec<u8>,
    locked: bool,
    access_check: Option<AccessCheck>,
    fail_next: Option<i32>,
    accesses: usize,
    violations: usize,
    unlock_calls: usize,
    erase_calls: usize,
}

/// A shared handle to an emulated flash chip.
#[derive(Clone)]
pub struct EmulatedFlash {
    chip: Arc<Mutex<Chip>>,
}

impl EmulatedFlash {
    /// A chip of `size_mb` MiB, erased, with an image header announcing its
    /// size.
    ///
    /// # Panics
    ///
    /// Panics if the size cannot be expressed in an image header.
    pub fn new(size_mb: usize) -> Self {
        let size_code = match size_mb {
            1 => 0x00,
            2 => 0x10,
            4 => 0x20,
            8 => 0x30,
            16 => 0x40,
            32 => 0x50,
            _ => panic!("unsupported flash size: {} MB", size_mb),
        };

        let flash = Self::with_size(size_mb << 20);
        flash.fill(0x1000, &[0xe9, 0x03, 0x02, size_code]);
        flash
    }

    /// A 1 MiB chip without an image header.
    pub fn blank() -> Self {
        Self::with_size(1 << 20)
    }

    fn with_size(size: usize) -> Self {
        Self {
            chip: Arc::new(Mutex::new(Chip {
                data: vec![ERASE_BYTE; size],
                locked: true,
                access_check: None,
                fail_next: None,
                accesses: 0,
                violations: 0,
                unlock_calls: 0,
                erase_calls: 0,
            })),
        }
    }

    /// Calls `check` on every access and counts the accesses it rejects in
    /// [`EmulatedFlash::violations`].
    pub fn with_access_check(self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.chip().access_check = Some(Box::new(check));
        self
    }

    /// Makes the next access return `rc` without touching the memory.
    pub fn fail_next(&self, rc: i32) {
        self.chip().fail_next = Some(rc);
    }

    /// Overwrites memory without going through the chip routines.
    pub fn fill(&self, address: u32, bytes: &[u8]) {
        self.chip().data[address as usize..][..bytes.len()].copy_from_slice(bytes);
    }

    /// Raw memory contents.
    pub fn contents(&self, address: u32, len: usize) -> Vec<u8> {
        self.chip().data[address as usize..][..len].to_vec()
    }

    /// Memory contents as seen through the flash encryption block.
    pub fn decrypted(&self, address: u32, len: usize) -> Vec<u8> {
        self.contents(address, len)
            .into_iter()
            .map(|byte| byte ^ ENCRYPTION_KEY)
            .collect()
    }

    /// Number of chip routine calls so far.
    pub fn accesses(&self) -> usize {
        self.chip().accesses
    }

    /// Number of accesses rejected by the access check.
    pub fn violations(&self) -> usize {
        self.chip().violations
    }

    /// Number of unlock calls so far.
    pub fn unlock_calls(&self) -> usize {
        self.chip().unlock_calls
    }

    /// Number of sector erases so far.
    pub fn erase_calls(&self) -> usize {
        self.chip().erase_calls
    }

    fn chip(&self) -> MutexGuard<'_, Chip> {
        self.chip.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Chip {
    fn enter(&mut self) -> Option<i32> {
        self.accesses += 1;

        if let Some(check) = &self.access_check {
            if !check() {
                print_error!("Flash accessed outside of a flash window");
                self.violations += 1;
            }
        }

        self.fail_next.take()
    }

    fn check(&self, address: u32, len: usize, data: *const u8, writing: bool) -> bool {
        if address % WORD_SIZE != 0 || len % WORD_SIZE as usize != 0 {
            print_error!("Not aligned: {address:#x} + {len}");
            return false;
        }
        if data.addr() % WORD_SIZE as usize != 0 {
            print_error!("Not aligned data: {:#x}", data.addr());
            return false;
        }
        if len > SECTOR_SIZE as usize {
            print_error!("Length out of range: {len} > {SECTOR_SIZE}");
            return false;
        }
        if address as usize + len > self.data.len() {
            print_error!("Out of range: {address:#x} + {len}");
            return false;
        }
        if writing && self.locked {
            print_error!("Flash locked");
            return false;
        }
        true
    }

    fn program(&mut self, address: u32, data: &[u8], key: u8) {
        for (dst, src) in self.data[address as usize..][..data.len()]
            .iter_mut()
            .zip(data)
        {
            *dst &= *src ^ key;
        }
    }
}

impl FlashChip for EmulatedFlash {
    fn read(&mut self, address: u32, data: &mut [u8]) -> i32 {
        let chip = &mut *self.chip();
        if let Some(rc) = chip.enter() {
            return rc;
        }
        if !chip.check(address, data.len(), data.as_ptr(), false) {
            return ERROR_CODE;
        }

        data.copy_from_slice(&chip.data[address as usize..][..data.len()]);
        SUCCESS_CODE
    }

    fn unlock(&mut self) -> i32 {
        let chip = &mut *self.chip();
        chip.unlock_calls += 1;
        if let Some(rc) = chip.enter() {
            return rc;
        }

        chip.locked = false;
        SUCCESS_CODE
    }

    fn erase_sector(&mut self, sector: u32) -> i32 {
        let chip = &mut *self.chip();
        chip.erase_calls += 1;
        if let Some(rc) = chip.enter() {
            return rc;
        }

        let address = sector as usize * SECTOR_SIZE as usize;
        if chip.locked || address + SECTOR_SIZE as usize > chip.data.len() {
            print_error!("Cannot erase sector {sector}");
            return ERROR_CODE;
        }

        chip.data[address..][..SECTOR_SIZE as usize].fill(ERASE_BYTE);
        SUCCESS_CODE
    }

    fn write(&mut self, address: u32, data: &[u8]) -> i32 {
        let chip = &mut *self.chip();
        if let Some(rc) = chip.enter() {
            return rc;
        }
        if !chip.check(address, data.len(), data.as_ptr(), true) {
            return ERROR_CODE;
        }

        chip.program(address, data, 0);
        SUCCESS_CODE
    }

    fn write_encrypted(&mut self, address: u32, data: &[u8]) -> i32 {
        let chip = &mut *self.chip();
        if let Some(rc) = chip.enter() {
            return rc;
        }
        if address % ENCRYPTED_WRITE_SIZE != 0
            || !chip.check(address, data.len(), data.as_ptr(), true)
        {
            return ERROR_CODE;
        }

        chip.program(address, data, ENCRYPTION_KEY);
        SUCCESS_CODE
    }
}
