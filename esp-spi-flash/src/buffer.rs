use core::ops::{Deref, DerefMut};

use crate::common::{SECTOR_SIZE, WORD_SIZE};

pub(crate) type FlashWordBuffer = AlignedBuffer<{ WORD_SIZE as usize }>;
pub(crate) type FlashSectorBuffer = AlignedBuffer<{ SECTOR_SIZE as usize }>;

/// Word-aligned scratch memory, for callers whose buffers the ROM routines
/// cannot use directly.
#[repr(C, align(4))]
pub(crate) struct AlignedBuffer<const N: usize> {
    // NOTE: Ensure that no unaligned fields are added above `data` to maintain its required
    // alignment
    data: [u8; N],
}

impl<const N: usize> AlignedBuffer<N> {
    pub(crate) const fn new() -> Self {
        Self { data: [0; N] }
    }
}

impl<const N: usize> Deref for AlignedBuffer<N> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<const N: usize> DerefMut for AlignedBuffer<N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}
