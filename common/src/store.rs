//! Checksum-validated persistence of [`DeviceConfig`] on raw NOR flash.
//!
//! The record lives at a fixed address inside an erase unit dedicated to it.
//! Saving erases the whole unit and programs the record one 4-byte word at a
//! time. There is no second bank: a failure after the erase leaves the unit
//! partially programmed and the next [`ConfigStore::load`] rejects it, so a
//! `WriteFailed` means the persisted settings are gone until the next
//! successful save.

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use log::{info, warn};
use thiserror::Error;

use crate::config::{record_checksum, DeviceConfig, CHECKSUM_OFFSET, CONFIG_MAGIC, RECORD_LEN};

/// Native program granularity used for the record.
pub const WORD_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no configuration record found (magic mismatch)")]
    NotFound,
    #[error("configuration checksum mismatch (stored {stored:#04x}, computed {computed:#04x})")]
    ChecksumMismatch { stored: u8, computed: u8 },
    #[error("flash read failed: {0:?}")]
    ReadFailed(NorFlashErrorKind),
    #[error("flash erase failed: {0:?}")]
    EraseFailed(NorFlashErrorKind),
    #[error("flash program failed at word {word}: {kind:?}")]
    WriteFailed { word: usize, kind: NorFlashErrorKind },
    #[error("record at {address:#x} cannot be stored in a single erase unit of this device")]
    Layout { address: u32 },
}

pub struct ConfigStore<F> {
    flash: F,
    address: u32,
    config: DeviceConfig,
    defaults: DeviceConfig,
}

impl<F: NorFlash> ConfigStore<F> {
    /// Binds the store to `address`, which must be word aligned and leave room for the
    /// whole record inside one erase unit.
    pub fn new(flash: F, address: u32) -> Result<Self, StoreError> {
        let offset_in_unit = address as usize % F::ERASE_SIZE;
        let fits_unit = offset_in_unit + RECORD_LEN <= F::ERASE_SIZE;
        let fits_device = address as usize + RECORD_LEN <= flash.capacity();
        let aligned = address as usize % WORD_SIZE == 0 && WORD_SIZE % F::WRITE_SIZE == 0;

        if !(fits_unit && fits_device && aligned) {
            return Err(StoreError::Layout { address });
        }

        Ok(Self {
            flash,
            address,
            config: DeviceConfig::blank(),
            defaults: DeviceConfig::blank(),
        })
    }

    /// Reads the record and, when it validates, replaces the in-RAM copy.
    pub fn load(&mut self) -> Result<&DeviceConfig, StoreError> {
        info!("loading configuration from flash at {:#x}", self.address);

        let mut record = [0_u8; RECORD_LEN];
        self.flash
            .read(self.address, &mut record)
            .map_err(|err| StoreError::ReadFailed(err.kind()))?;

        if record[..CONFIG_MAGIC.len()] != CONFIG_MAGIC {
            warn!("no valid magic bytes in flash");
            return Err(StoreError::NotFound);
        }

        let stored = record[CHECKSUM_OFFSET];
        let computed = record_checksum(&record);
        if stored != computed {
            warn!("flash configuration checksum mismatch (stored {stored:#04x}, computed {computed:#04x})");
            return Err(StoreError::ChecksumMismatch { stored, computed });
        }

        self.config = DeviceConfig::decode(&record);
        info!("configuration loaded for device `{}`", self.config.device_id);
        Ok(&self.config)
    }

    /// Seals `config` and writes it to flash. The in-RAM copy only changes once
    /// every word has been programmed.
    pub fn save(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        let sealed = config.clone().sealed();
        let record = sealed.encode();

        let unit_start = self.address - self.address % F::ERASE_SIZE as u32;
        let unit_end = unit_start + F::ERASE_SIZE as u32;

        info!(
            "saving configuration (checksum {:#04x}, {} words)",
            sealed.checksum,
            RECORD_LEN / WORD_SIZE
        );

        self.flash.erase(unit_start, unit_end).map_err(|err| {
            warn!("flash erase failed; persisted configuration left untouched");
            StoreError::EraseFailed(err.kind())
        })?;

        for (word, chunk) in record.chunks(WORD_SIZE).enumerate() {
            let offset = self.address + (word * WORD_SIZE) as u32;
            self.flash.write(offset, chunk).map_err(|err| {
                warn!("flash write failed at word {word}; persisted configuration is likely lost");
                StoreError::WriteFailed {
                    word,
                    kind: err.kind(),
                }
            })?;
        }

        self.config = sealed;
        info!("configuration saved");
        Ok(())
    }

    /// Magic check on the in-RAM copy.
    pub fn is_valid(&self) -> bool {
        self.config.has_valid_magic()
    }

    pub fn set_defaults(&mut self, defaults: DeviceConfig) {
        self.defaults = defaults.sealed();
        self.config = self.defaults.clone();
    }

    pub fn reset_to_defaults(&mut self) {
        self.config = self.defaults.clone();
    }

    pub fn get_config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn into_flash(self) -> F {
        self.flash
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{FixedStr, PADDING_OFFSET},
        flash::{RamFlash, RAM_FLASH_ERASE_SIZE},
        testutil::FaultyFlash,
    };

    fn sample_config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.device_id.set("kitchen-node");
        config.location.set("Kitchen, 2nd floor");
        config.broker_host.set("broker.lan");
        config.broker_port = 8883;
        config.topic.set("home/kitchen/env");
        config
    }

    #[test]
    fn blank_flash_reports_not_found() {
        let mut store = ConfigStore::new(RamFlash::new(2), 0).unwrap();
        assert_eq!(store.load().unwrap_err(), StoreError::NotFound);
    }

    #[test]
    fn save_then_load_round_trips_every_field() {
        let config = sample_config();
        let mut store = ConfigStore::new(RamFlash::new(2), 0x1000).unwrap();
        store.save(&config).unwrap();

        let mut reopened = ConfigStore::new(store.into_flash(), 0x1000).unwrap();
        let loaded = reopened.load().unwrap().clone();
        assert_eq!(loaded, config.sealed());
    }

    #[test]
    fn round_trips_fields_filled_to_capacity() {
        let mut config = DeviceConfig::blank();
        config.device_id.set(&"d".repeat(64));
        config.model.set(&"m".repeat(64));
        config.location.set(&"l".repeat(64));
        config.wifi_ssid.set(&"s".repeat(64));
        config.wifi_password.set(&"p".repeat(128));
        config.broker_host.set(&"h".repeat(128));
        config.topic.set(&"t".repeat(128));
        config.broker_port = u32::MAX;

        let mut store = ConfigStore::new(RamFlash::new(1), 0).unwrap();
        store.save(&config).unwrap();
        let loaded = store.load().unwrap().clone();

        assert_eq!(loaded.device_id.as_str().len(), 31);
        assert_eq!(loaded.model.as_str().len(), 15);
        assert_eq!(loaded.wifi_password.as_str().len(), 63);
        assert_eq!(loaded, config.sealed());
    }

    #[test]
    fn save_zeroes_padding_and_stamps_magic() {
        let mut config = sample_config();
        config.magic = *b"XXXX";
        let mut store = ConfigStore::new(RamFlash::new(1), 0).unwrap();
        store.save(&config).unwrap();

        let flash = store.into_flash();
        assert_eq!(&flash.image()[..4], b"AZ31");
        assert_eq!(&flash.image()[PADDING_OFFSET..RECORD_LEN], &[0, 0, 0]);
    }

    #[test]
    fn any_single_bit_flip_outside_checksum_is_detected() {
        let mut store = ConfigStore::new(RamFlash::new(1), 0).unwrap();
        store.save(&sample_config()).unwrap();
        let pristine = store.into_flash();

        for byte in CONFIG_MAGIC.len()..CHECKSUM_OFFSET {
            for bit in 0..8 {
                let mut flash = pristine.clone();
                flash.image_mut()[byte] ^= 1 << bit;
                let mut store = ConfigStore::new(flash, 0).unwrap();
                assert!(
                    matches!(store.load(), Err(StoreError::ChecksumMismatch { .. })),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn bit_flip_in_magic_reads_as_not_found() {
        let mut store = ConfigStore::new(RamFlash::new(1), 0).unwrap();
        store.save(&sample_config()).unwrap();
        let mut flash = store.into_flash();
        flash.image_mut()[2] ^= 0x01;

        let mut store = ConfigStore::new(flash, 0).unwrap();
        assert_eq!(store.load().unwrap_err(), StoreError::NotFound);
    }

    #[test]
    fn erase_failure_aborts_before_touching_flash() {
        let mut store = ConfigStore::new(RamFlash::new(1), 0).unwrap();
        store.save(&sample_config()).unwrap();

        let mut faulty = FaultyFlash::new(store.into_flash());
        faulty.fail_erase = true;
        let mut store = ConfigStore::new(faulty, 0).unwrap();

        let mut changed = sample_config();
        changed.device_id.set("other");
        assert_eq!(
            store.save(&changed),
            Err(StoreError::EraseFailed(NorFlashErrorKind::Other))
        );

        assert_eq!(store.get_config().device_id.as_str(), "kitchen-node");
        let loaded = store.load().unwrap();
        assert_eq!(loaded.device_id.as_str(), "kitchen-node");
    }

    #[test]
    fn partial_program_is_rejected_on_next_load() {
        let mut faulty = FaultyFlash::new(RamFlash::new(1));
        faulty.fail_after_writes = Some(10);
        let mut store = ConfigStore::new(faulty, 0).unwrap();

        assert_eq!(
            store.save(&sample_config()),
            Err(StoreError::WriteFailed {
                word: 10,
                kind: NorFlashErrorKind::Other
            })
        );
        assert_eq!(store.get_config(), &DeviceConfig::blank());
        assert!(matches!(
            store.load(),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn save_erases_the_whole_unit() {
        let mut flash = RamFlash::new(1);
        flash.write(2048, &[0, 0, 0, 0]).unwrap();

        let mut store = ConfigStore::new(flash, 0).unwrap();
        store.save(&sample_config()).unwrap();
        assert_eq!(&store.into_flash().image()[2048..2052], &[0xFF; 4]);
    }

    #[test]
    fn rejects_record_straddling_erase_units() {
        let result = ConfigStore::new(RamFlash::new(2), (RAM_FLASH_ERASE_SIZE - 8) as u32);
        assert!(matches!(result, Err(StoreError::Layout { .. })));

        let result = ConfigStore::new(RamFlash::new(1), 2);
        assert!(matches!(result, Err(StoreError::Layout { .. })));
    }

    #[test]
    fn defaults_and_accessors_do_not_touch_flash() {
        let mut store = ConfigStore::new(RamFlash::new(1), 0).unwrap();
        let mut defaults = DeviceConfig::default();
        defaults.location = FixedStr::new("lab");
        store.set_defaults(defaults.clone());

        assert!(store.is_valid());
        assert_eq!(store.get_config(), &defaults.clone().sealed());

        store.save(&sample_config()).unwrap();
        store.reset_to_defaults();
        assert_eq!(store.get_config().location.as_str(), "lab");
        assert_eq!(store.load().unwrap().location.as_str(), "Kitchen, 2nd floor");
    }
}
