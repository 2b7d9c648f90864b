use embedded_storage::nor_flash::{
    ErrorType,
    NorFlash,
    NorFlashError,
    NorFlashErrorKind,
    ReadNorFlash,
};
use esp_flash_guard::Port;

use crate::{
    FlashChip,
    FlashStorage,
    FlashStorageError,
    common::{SECTOR_SIZE, WORD_SIZE},
};

impl NorFlashError for FlashStorageError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::NotAligned => NorFlashErrorKind::NotAligned,
            Self::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            _ => NorFlashErrorKind::Other,
        }
    }
}

impl<P: Port, F: FlashChip> ErrorType for FlashStorage<'_, P, F> {
    type Error = FlashStorageError;
}

impl<P: Port, F: FlashChip> ReadNorFlash for FlashStorage<'_, P, F> {
    const READ_SIZE: usize = Self::WORD_SIZE as _;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_alignment::<WORD_SIZE>(offset, bytes.len())?;
        self.check_bounds(offset, bytes.len())?;

        self.read_sectors(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<P: Port, F: FlashChip> NorFlash for FlashStorage<'_, P, F> {
    const WRITE_SIZE: usize = Self::WORD_SIZE as _;
    const ERASE_SIZE: usize = Self::SECTOR_SIZE as _;

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_alignment::<WORD_SIZE>(offset, bytes.len())?;
        self.check_bounds(offset, bytes.len())?;

        self.write_sectors(offset, bytes)
    }

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let len = to.checked_sub(from).ok_or(FlashStorageError::OutOfBounds)? as usize;
        self.check_alignment::<SECTOR_SIZE>(from, len)?;
        self.check_bounds(from, len)?;

        for sector in from / Self::SECTOR_SIZE..to / Self::SECTOR_SIZE {
            self.internal_erase(sector)?;
        }

        Ok(())
    }
}
