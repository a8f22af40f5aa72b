use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

pub const RAM_FLASH_ERASE_SIZE: usize = 4096;
pub const RAM_FLASH_WRITE_SIZE: usize = 4;

/// In-memory NOR flash: erase sets bytes to 0xFF, programming can only clear bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamFlash {
    data: Vec<u8>,
}

impl RamFlash {
    /// Creates an erased device of `units` erase units.
    pub fn new(units: usize) -> Self {
        Self {
            data: vec![0xFF; units * RAM_FLASH_ERASE_SIZE],
        }
    }

    /// Wraps an existing image, padding it with erased bytes up to a whole erase unit.
    pub fn from_image(mut data: Vec<u8>) -> Self {
        let units = data.len().div_ceil(RAM_FLASH_ERASE_SIZE).max(1);
        data.resize(units * RAM_FLASH_ERASE_SIZE, 0xFF);
        Self { data }
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Raw mutable access, used to simulate bit rot in tests and tooling.
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, NorFlashErrorKind> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(NorFlashErrorKind::OutOfBounds)?;
        if end > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl ErrorType for RamFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for RamFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for RamFlash {
    const WRITE_SIZE: usize = RAM_FLASH_WRITE_SIZE;
    const ERASE_SIZE: usize = RAM_FLASH_ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.range(from, (to - from) as usize)?;
        self.data[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.range(offset, bytes.len())?;
        for (cell, byte) in self.data[range].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}
