use embedded_storage::{ReadStorage, Storage};
use esp_flash_guard::Port;

use crate::{
    FlashChip,
    FlashStorage,
    FlashStorageError,
    buffer::{FlashSectorBuffer, FlashWordBuffer},
    common::{SECTOR_SIZE, WORD_SIZE},
};

impl<P: Port, F: FlashChip> ReadStorage for FlashStorage<'_, P, F> {
    type Error = FlashStorageError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_bounds(offset, bytes.len())?;

        let mut offset = offset;
        let mut bytes = bytes;

        // Leading bytes up to the next word boundary.
        let head = (offset % WORD_SIZE) as usize;
        if head != 0 && !bytes.is_empty() {
            let mut word = FlashWordBuffer::new();
            let word_offset = offset - head as u32;
            self.internal_read(word_offset, &mut word)?;

            let len = bytes.len().min(WORD_SIZE as usize - head);
            bytes[..len].copy_from_slice(&word[head..][..len]);

            offset = word_offset + WORD_SIZE;
            bytes = &mut core::mem::take(&mut bytes)[len..];
        }

        let body = bytes.len() - bytes.len() % WORD_SIZE as usize;
        let (body, tail) = bytes.split_at_mut(body);
        self.read_sectors(offset, body)?;

        if !tail.is_empty() {
            let mut word = FlashWordBuffer::new();
            self.internal_read(offset + body.len() as u32, &mut word)?;
            tail.copy_from_slice(&word[..tail.len()]);
        }

        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<P: Port, F: FlashChip> Storage for FlashStorage<'_, P, F> {
    /// Writes `bytes` at any offset, preserving the rest of every sector
    /// touched.
    ///
    /// A sector is only erased when the new data needs bits set that are
    /// currently cleared. Otherwise the affected words are programmed in
    /// place.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_bounds(offset, bytes.len())?;

        let mut sector = FlashSectorBuffer::new();
        let mut offset = offset;
        let mut bytes = bytes;

        while !bytes.is_empty() {
            let sector_offset = offset - offset % SECTOR_SIZE;
            let start = (offset - sector_offset) as usize;
            let len = bytes.len().min(SECTOR_SIZE as usize - start);
            let (data, rest) = bytes.split_at(len);

            self.read_sectors(sector_offset, &mut sector)?;
            let current = &mut sector[start..][..len];

            if *current != *data {
                let needs_erase = current.iter().zip(data).any(|(old, new)| old & new != *new);
                current.copy_from_slice(data);

                if needs_erase {
                    trace!("Rewriting sector at {:#x}", sector_offset);
                    self.internal_erase(sector_offset / SECTOR_SIZE)?;
                    self.write_sectors(sector_offset, &sector)?;
                } else {
                    let first = start - start % WORD_SIZE as usize;
                    let end = (start + len).next_multiple_of(WORD_SIZE as usize);
                    self.write_sectors(sector_offset + first as u32, &sector[first..end])?;
                }
            }

            offset += len as u32;
            bytes = rest;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use esp_flash_guard::{FlashGuardContext, emulation::EmulatedSmp};

    use super::*;
    use crate::{Config, emulation::EmulatedFlash};

    const BASE: u32 = 0x20000;

    fn guard() -> FlashGuardContext<EmulatedSmp> {
        FlashGuardContext::new(EmulatedSmp::new(1))
    }

    #[test]
    fn unaligned_reads() {
        let guard = guard();
        let flash = EmulatedFlash::new(4);
        let pattern: Vec<u8> = (0..64).collect();
        flash.fill(BASE, &pattern);

        let mut storage = FlashStorage::new(&guard, flash, Config::default()).unwrap();

        for (start, len) in [(0, 64), (1, 2), (3, 1), (1, 7), (5, 40), (62, 2), (2, 0)] {
            let mut data = vec![0u8; len];
            storage.read(BASE + start as u32, &mut data).unwrap();
            assert_eq!(data, pattern[start..][..len], "start {start}, len {len}");
        }
    }

    #[test]
    fn read_until_the_end() {
        let guard = guard();
        let mut storage = FlashStorage::new(&guard, EmulatedFlash::new(1), Config::default()).unwrap();
        let end = ReadStorage::capacity(&storage) as u32;

        let mut data = [0u8; 3];
        storage.read(end - 3, &mut data).unwrap();
        assert_eq!(
            storage.read(end - 2, &mut data),
            Err(FlashStorageError::OutOfBounds)
        );
    }

    #[test]
    fn write_preserves_neighbours() {
        let guard = guard();
        let flash = EmulatedFlash::new(4);
        flash.fill(BASE, &[0xaa; SECTOR_SIZE as usize]);

        let mut storage = FlashStorage::new(&guard, flash.clone(), Config::default()).unwrap();
        storage.write(BASE + 5, &[1, 2, 3]).unwrap();

        assert_eq!(flash.contents(BASE, 4), [0xaa; 4]);
        assert_eq!(flash.contents(BASE + 4, 5), [0xaa, 1, 2, 3, 0xaa]);
        assert_eq!(flash.contents(BASE + 9, 4), [0xaa; 4]);
        assert_eq!(flash.erase_calls(), 1);
    }

    #[test]
    fn clearing_bits_does_not_erase() {
        let guard = guard();
        let flash = EmulatedFlash::new(4);
        let mut storage = FlashStorage::new(&guard, flash.clone(), Config::default()).unwrap();

        // Fresh sectors are erased.
        storage.write(BASE + 1, &[0x0f, 0x00]).unwrap();
        storage.write(BASE + 1, &[0x0e]).unwrap();
        // Same contents, nothing to do.
        storage.write(BASE + 2, &[0x00]).unwrap();

        assert_eq!(flash.contents(BASE, 4), [0xff, 0x0e, 0x00, 0xff]);
        assert_eq!(flash.erase_calls(), 0);
    }

    #[test]
    fn write_across_sector_boundary() {
        let guard = guard();
        let flash = EmulatedFlash::new(4);
        flash.fill(BASE + SECTOR_SIZE - 4, &[0; 8]);

        let mut storage = FlashStorage::new(&guard, flash.clone(), Config::default()).unwrap();
        storage
            .write(BASE + SECTOR_SIZE - 2, &[0x11, 0x22, 0x33, 0x44])
            .unwrap();

        assert_eq!(
            flash.contents(BASE + SECTOR_SIZE - 4, 8),
            [0, 0, 0x11, 0x22, 0x33, 0x44, 0, 0]
        );
        assert_eq!(flash.erase_calls(), 2);
    }

    #[test]
    fn rewrite_refused_in_protected_sector() {
        let guard = guard();
        let flash = EmulatedFlash::new(4);
        flash.fill(0x8C00, &[0; 4]);

        let mut storage = FlashStorage::new(&guard, flash.clone(), Config::default()).unwrap();

        // Erasing the sector would take the partition table with it.
        assert_eq!(
            storage.write(0x8C00, &[0xff]),
            Err(FlashStorageError::DangerousWrite)
        );
        assert_eq!(flash.contents(0x8C00, 1), [0]);
    }
}
