use crate::FlashChip;

unsafe extern "C" {
    fn esp_rom_spiflash_read(src_addr: u32, data: *mut u32, len: u32) -> i32;
    fn esp_rom_spiflash_unlock() -> i32;
    fn esp_rom_spiflash_erase_sector(sector_number: u32) -> i32;
    fn esp_rom_spiflash_write(dest_addr: u32, data: *const u32, len: u32) -> i32;
    fn esp_rom_spiflash_write_encrypted(dest_addr: u32, data: *const u32, len: u32) -> i32;
}

/// The SPI flash routines of the chip's mask ROM.
///
/// These routines drive the flash controller directly and must only run
/// inside a flash window, which [`FlashStorage`](crate::FlashStorage)
/// guarantees.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RomFlash {
    _private: (),
}

impl RomFlash {
    /// Takes ownership of the flash controller.
    ///
    /// # Safety
    ///
    /// At most one instance may exist, and nothing else may use the ROM flash
    /// routines while it does.
    pub unsafe fn steal() -> Self {
        Self { _private: () }
    }
}

impl FlashChip for RomFlash {
    fn read(&mut self, address: u32, data: &mut [u8]) -> i32 {
        unsafe { esp_rom_spiflash_read(address, data.as_mut_ptr().cast(), data.len() as u32) }
    }

    fn unlock(&mut self) -> i32 {
        unsafe { esp_rom_spiflash_unlock() }
    }

    fn erase_sector(&mut self, sector: u32) -> i32 {
        unsafe { esp_rom_spiflash_erase_sector(sector) }
    }

    fn write(&mut self, address: u32, data: &[u8]) -> i32 {
        unsafe { esp_rom_spiflash_write(address, data.as_ptr().cast(), data.len() as u32) }
    }

    fn write_encrypted(&mut self, address: u32, data: &[u8]) -> i32 {
        unsafe {
            esp_rom_spiflash_write_encrypted(address, data.as_ptr().cast(), data.len() as u32)
        }
    }
}
