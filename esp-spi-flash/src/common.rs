use core::fmt;

use esp_flash_guard::{FlashGuardContext, GuardMode, Port};

use crate::buffer::{FlashSectorBuffer, FlashWordBuffer};

pub(crate) const WORD_SIZE: u32 = 4;
pub(crate) const SECTOR_SIZE: u32 = 4096;
pub(crate) const ENCRYPTED_WRITE_SIZE: u32 = 16;

// Image header of the second stage bootloader.
const HEADER_ADDR: u32 = 0x1000;

/// Raw SPI flash routines, as provided by the chip ROM.
///
/// [`FlashStorage`] only calls these from inside a flash window. Buffers are
/// word-aligned and their length is a multiple of the word size. Return
/// values follow the ROM convention, see [`check_rc`].
pub trait FlashChip {
    /// Reads `data.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, data: &mut [u8]) -> i32;

    /// Clears the write protection of the flash chip.
    fn unlock(&mut self) -> i32;

    /// Erases the sector with the given number.
    fn erase_sector(&mut self, sector: u32) -> i32;

    /// Programs `data` starting at `address`. Programming can only clear bits.
    fn write(&mut self, address: u32, data: &[u8]) -> i32;

    /// Programs `data` through the flash encryption block.
    fn write_encrypted(&mut self, address: u32, data: &[u8]) -> i32;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Flash storage error.
pub enum FlashStorageError {
    /// I/O error.
    IoError,
    /// I/O operation timed out.
    IoTimeout,
    /// Flash could not be unlocked for writing.
    CantUnlock,
    /// Address or length not aligned to required boundary.
    NotAligned,
    /// Address or length out of bounds.
    OutOfBounds,
    /// The flash size could not be determined from the image header.
    NotInitialized,
    /// Data read back after a write differs from what was written.
    VerifyFailed,
    /// The write or erase touches the bootloader or the partition table and
    /// [`DangerousWrites::Allowed`] is not configured.
    DangerousWrite,
    /// Other error with the given error code.
    Other(i32),
}

impl fmt::Display for FlashStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError => write!(f, "flash I/O error"),
            Self::IoTimeout => write!(f, "flash operation timed out"),
            Self::CantUnlock => write!(f, "flash could not be unlocked"),
            Self::NotAligned => write!(f, "address or length not aligned"),
            Self::OutOfBounds => write!(f, "address or length out of bounds"),
            Self::NotInitialized => write!(f, "flash size unknown"),
            Self::VerifyFailed => write!(f, "flash contents differ from written data"),
            Self::DangerousWrite => write!(f, "write to a protected flash region refused"),
            Self::Other(rc) => write!(f, "flash error code {}", rc),
        }
    }
}

impl core::error::Error for FlashStorageError {}

#[inline(always)]
/// Check return code from flash operations.
pub fn check_rc(rc: i32) -> Result<(), FlashStorageError> {
    match rc {
        0 => Ok(()),
        1 => Err(FlashStorageError::IoError),
        2 => Err(FlashStorageError::IoTimeout),
        _ => Err(FlashStorageError::Other(rc)),
    }
}

/// What to do with writes and erases below [`Config::protected_end`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DangerousWrites {
    /// Refuse them with [`FlashStorageError::DangerousWrite`].
    #[default]
    Failed,
    /// Perform them.
    Allowed,
}

/// Flash storage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    guard: GuardMode,
    verify_writes: bool,
    dangerous_writes: DangerousWrites,
    protected_end: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// The default configuration.
    pub const fn new() -> Self {
        Self {
            guard: GuardMode::Scheduler,
            verify_writes: false,
            dangerous_writes: DangerousWrites::Failed,
            // Bootloader and partition table.
            protected_end: 0x8C00,
        }
    }

    /// How flash windows are opened. [`GuardMode::NoOs`] is meant for
    /// contexts without a running scheduler, such as a panic handler.
    pub const fn with_guard(mut self, guard: GuardMode) -> Self {
        self.guard = guard;
        self
    }

    /// Read back and compare every write.
    pub const fn with_verify_writes(mut self, verify_writes: bool) -> Self {
        self.verify_writes = verify_writes;
        self
    }

    /// Policy for writes and erases below [`Config::protected_end`].
    pub const fn with_dangerous_writes(mut self, dangerous_writes: DangerousWrites) -> Self {
        self.dangerous_writes = dangerous_writes;
        self
    }

    /// End of the protected region at the start of the flash.
    pub const fn with_protected_end(mut self, protected_end: u32) -> Self {
        self.protected_end = protected_end;
        self
    }

    /// See [`Config::with_guard`].
    pub const fn guard(&self) -> GuardMode {
        self.guard
    }

    /// See [`Config::with_verify_writes`].
    pub const fn verify_writes(&self) -> bool {
        self.verify_writes
    }

    /// See [`Config::with_dangerous_writes`].
    pub const fn dangerous_writes(&self) -> DangerousWrites {
        self.dangerous_writes
    }

    /// See [`Config::with_protected_end`].
    pub const fn protected_end(&self) -> u32 {
        self.protected_end
    }
}

/// Flash storage abstraction.
///
/// Every access to the chip runs inside a window of the shared
/// [`FlashGuardContext`], so no core executes from flash in the meantime.
pub struct FlashStorage<'d, P: Port, F: FlashChip> {
    pub(crate) capacity: usize,
    unlocked: bool,
    config: Config,
    guard: &'d FlashGuardContext<P>,
    flash: F,
}

impl<P: Port, F: FlashChip> fmt::Debug for FlashStorage<'_, P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashStorage")
            .field("capacity", &self.capacity)
            .field("unlocked", &self.unlocked)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'d, P: Port, F: FlashChip> FlashStorage<'d, P, F> {
    /// Flash word size in bytes.
    pub const WORD_SIZE: u32 = WORD_SIZE;
    /// Flash sector size in bytes.
    pub const SECTOR_SIZE: u32 = SECTOR_SIZE;
    /// Alignment of encrypted writes, in bytes.
    pub const ENCRYPTED_WRITE_SIZE: u32 = ENCRYPTED_WRITE_SIZE;

    /// Create a new flash storage instance.
    ///
    /// The flash size is taken from the bootloader image header. If the
    /// header is missing, every later access fails with
    /// [`FlashStorageError::NotInitialized`].
    pub fn new(
        guard: &'d FlashGuardContext<P>,
        flash: F,
        config: Config,
    ) -> Result<Self, FlashStorageError> {
        let mut storage = Self {
            capacity: 0,
            unlocked: false,
            config,
            guard,
            flash,
        };

        let mut buffer = FlashWordBuffer::new();
        storage.internal_read(HEADER_ADDR, &mut buffer)?;

        let mb = match buffer[3] & 0xf0 {
            0x00 => 1,
            0x10 => 2,
            0x20 => 4,
            0x30 => 8,
            0x40 => 16,
            0x50 => 32,
            _ => 0,
        };
        storage.capacity = mb * 1024 * 1024;

        if storage.capacity == 0 {
            warn!("No valid image header, flash size unknown");
        } else {
            info!("Flash size: {} MB", mb);
        }

        Ok(storage)
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The guard this storage opens its flash windows with.
    pub fn guard(&self) -> &'d FlashGuardContext<P> {
        self.guard
    }

    /// Gives the flash chip back.
    pub fn release(self) -> F {
        self.flash
    }

    /// Writes `bytes` through the flash encryption block.
    ///
    /// Offset and length must be multiples of
    /// [`FlashStorage::ENCRYPTED_WRITE_SIZE`]. Written data is not verified,
    /// reading it back returns the ciphertext.
    pub fn write_encrypted(&mut self, offset: u32, bytes: &[u8]) -> Result<(), FlashStorageError> {
        self.check_alignment::<ENCRYPTED_WRITE_SIZE>(offset, bytes.len())?;
        self.check_bounds(offset, bytes.len())?;
        self.check_writable(offset, bytes.len())?;
        self.unlock_once()?;

        let mut buffer = FlashSectorBuffer::new();
        for (offset, chunk) in (offset..)
            .step_by(SECTOR_SIZE as _)
            .zip(bytes.chunks(SECTOR_SIZE as _))
        {
            let chunk = if is_word_aligned(chunk) {
                chunk
            } else {
                buffer[..chunk.len()].copy_from_slice(chunk);
                &buffer[..chunk.len()]
            };

            check_rc(self.in_window(|flash| flash.write_encrypted(offset, chunk)))?;
        }

        Ok(())
    }

    #[inline(always)]
    pub(crate) fn check_alignment<const ALIGN: u32>(
        &self,
        offset: u32,
        length: usize,
    ) -> Result<(), FlashStorageError> {
        let offset = offset as usize;
        if offset % ALIGN as usize != 0 || length % ALIGN as usize != 0 {
            return Err(FlashStorageError::NotAligned);
        }
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn check_bounds(&self, offset: u32, length: usize) -> Result<(), FlashStorageError> {
        if self.capacity == 0 {
            return Err(FlashStorageError::NotInitialized);
        }

        let offset = offset as usize;
        if length > self.capacity || offset > self.capacity - length {
            return Err(FlashStorageError::OutOfBounds);
        }
        Ok(())
    }

    fn check_writable(&self, offset: u32, length: usize) -> Result<(), FlashStorageError> {
        if length == 0 || offset >= self.config.protected_end {
            return Ok(());
        }

        match self.config.dangerous_writes {
            DangerousWrites::Allowed => {
                debug!("Writing to protected region at {:#x}", offset);
                Ok(())
            }
            DangerousWrites::Failed => {
                warn!(
                    "Refusing to write {} bytes at {:#x}, below {:#x}",
                    length, offset, self.config.protected_end
                );
                Err(FlashStorageError::DangerousWrite)
            }
        }
    }

    /// Runs `f` on the flash chip inside a flash window.
    fn in_window<R>(&mut self, f: impl FnOnce(&mut F) -> R) -> R {
        let flash = &mut self.flash;
        self.guard.run_with(self.config.guard, || f(flash))
    }

    /// Reads a word-aligned, word-sized `bytes` from at most one sector.
    pub(crate) fn internal_read(
        &mut self,
        offset: u32,
        bytes: &mut [u8],
    ) -> Result<(), FlashStorageError> {
        check_rc(self.in_window(|flash| flash.read(offset, bytes)))
    }

    /// Reads a word-aligned range of any size, splitting it at sector
    /// boundaries.
    pub(crate) fn read_sectors(
        &mut self,
        offset: u32,
        bytes: &mut [u8],
    ) -> Result<(), FlashStorageError> {
        if is_word_aligned(bytes) {
            for (offset, chunk) in (offset..)
                .step_by(SECTOR_SIZE as _)
                .zip(bytes.chunks_mut(SECTOR_SIZE as _))
            {
                self.internal_read(offset, chunk)?;
            }
        } else {
            let mut buffer = FlashSectorBuffer::new();
            for (offset, chunk) in (offset..)
                .step_by(SECTOR_SIZE as _)
                .zip(bytes.chunks_mut(SECTOR_SIZE as _))
            {
                self.internal_read(offset, &mut buffer[..chunk.len()])?;
                chunk.copy_from_slice(&buffer[..chunk.len()]);
            }
        }

        Ok(())
    }

    /// Writes a word-aligned range of any size, splitting it at sector
    /// boundaries.
    pub(crate) fn write_sectors(&mut self, offset: u32, bytes: &[u8]) -> Result<(), FlashStorageError> {
        if is_word_aligned(bytes) {
            for (offset, chunk) in (offset..)
                .step_by(SECTOR_SIZE as _)
                .zip(bytes.chunks(SECTOR_SIZE as _))
            {
                self.internal_write(offset, chunk)?;
            }
        } else {
            let mut buffer = FlashSectorBuffer::new();
            for (offset, chunk) in (offset..)
                .step_by(SECTOR_SIZE as _)
                .zip(bytes.chunks(SECTOR_SIZE as _))
            {
                buffer[..chunk.len()].copy_from_slice(chunk);
                self.internal_write(offset, &buffer[..chunk.len()])?;
            }
        }

        Ok(())
    }

    #[inline(always)]
    fn unlock_once(&mut self) -> Result<(), FlashStorageError> {
        if !self.unlocked {
            if self.in_window(|flash| flash.unlock()) != 0 {
                return Err(FlashStorageError::CantUnlock);
            }
            debug!("Flash unlocked");
            self.unlocked = true;
        }
        Ok(())
    }

    pub(crate) fn internal_erase(&mut self, sector: u32) -> Result<(), FlashStorageError> {
        self.check_writable(sector * SECTOR_SIZE, SECTOR_SIZE as usize)?;
        self.unlock_once()?;
        check_rc(self.in_window(|flash| flash.erase_sector(sector)))
    }

    /// Writes a word-aligned, word-sized `bytes` into at most one sector.
    pub(crate) fn internal_write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), FlashStorageError> {
        self.check_writable(offset, bytes.len())?;
        self.unlock_once()?;
        check_rc(self.in_window(|flash| flash.write(offset, bytes)))?;

        if self.config.verify_writes {
            self.verify(offset, bytes)?;
        }

        Ok(())
    }

    fn verify(&mut self, offset: u32, expected: &[u8]) -> Result<(), FlashStorageError> {
        let mut buffer = FlashSectorBuffer::new();
        let actual = &mut buffer[..expected.len()];
        self.internal_read(offset, actual)?;

        if *actual != *expected {
            warn!("Flash contents at {:#x} differ after write", offset);
            return Err(FlashStorageError::VerifyFailed);
        }

        Ok(())
    }
}

#[inline(always)]
pub(crate) fn is_word_aligned(bytes: &[u8]) -> bool {
    bytes.as_ptr().addr() % WORD_SIZE as usize == 0
}
