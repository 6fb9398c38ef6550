//! Manufacturing record (spec.md section 3/4.3, expanded per
//! `original_source/.../manufStore.c`), stored in INFO-D at `0x1000`.
//! Holds per-pad baseline capacitance and temperature so the excluded
//! cap-sense driver can restore its baselines at boot, plus the
//! manufacturing-line GPS/modem self-test results.

use crate::crc16::crc16;
use crate::error::FaultKind;
use crate::flash::Flash;

pub const MANUF_LOCATION: u32 = 0x1000;
const MANUF_MAGIC: u16 = 0x1234;
const WRITE_RETRIES: u8 = 4;
const NUM_PADS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ManufRecord {
    pub magic: u16,
    pub record_length: u16,
    pub pad_baseline: [u16; NUM_PADS],
    pub baseline_temperature: i16,
    pub gps_test_valid: u16,
    pub gps_test_sat_count: u16,
    pub modem_test_success: u16,
    pub modem_test_signal_strength: u16,
    pub crc16: u16,
}

impl ManufRecord {
    pub const SIZE: usize = 2 + 2 + NUM_PADS * 2 + 2 + 2 + 2 + 2 + 2 + 2;

    const fn blank() -> Self {
        Self {
            magic: MANUF_MAGIC,
            record_length: Self::SIZE as u16,
            pad_baseline: [0; NUM_PADS],
            baseline_temperature: 0,
            gps_test_valid: 0,
            gps_test_sat_count: 0,
            modem_test_success: 0,
            modem_test_signal_strength: 0,
            crc16: 0,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut i = 0;
        buf[i..i + 2].copy_from_slice(&self.magic.to_be_bytes());
        i += 2;
        buf[i..i + 2].copy_from_slice(&self.record_length.to_be_bytes());
        i += 2;
        for baseline in &self.pad_baseline {
            buf[i..i + 2].copy_from_slice(&baseline.to_be_bytes());
            i += 2;
        }
        buf[i..i + 2].copy_from_slice(&self.baseline_temperature.to_be_bytes());
        i += 2;
        buf[i..i + 2].copy_from_slice(&self.gps_test_valid.to_be_bytes());
        i += 2;
        buf[i..i + 2].copy_from_slice(&self.gps_test_sat_count.to_be_bytes());
        i += 2;
        buf[i..i + 2].copy_from_slice(&self.modem_test_success.to_be_bytes());
        i += 2;
        buf[i..i + 2].copy_from_slice(&self.modem_test_signal_strength.to_be_bytes());
        i += 2;
        buf[i..i + 2].copy_from_slice(&self.crc16.to_be_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut i = 0;
        let magic = u16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        let record_length = u16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        let mut pad_baseline = [0u16; NUM_PADS];
        for slot in &mut pad_baseline {
            *slot = u16::from_be_bytes([buf[i], buf[i + 1]]);
            i += 2;
        }
        let baseline_temperature = i16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        let gps_test_valid = u16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        let gps_test_sat_count = u16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        let modem_test_success = u16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        let modem_test_signal_strength = u16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        let crc16 = u16::from_be_bytes([buf[i], buf[i + 1]]);
        Self {
            magic,
            record_length,
            pad_baseline,
            baseline_temperature,
            gps_test_valid,
            gps_test_sat_count,
            modem_test_success,
            modem_test_signal_strength,
            crc16,
        }
    }
}

pub struct ManufRecordStore<F> {
    flash: F,
    base: u32,
}

impl<F: Flash> ManufRecordStore<F> {
    pub const fn new(flash: F) -> Self {
        Self {
            flash,
            base: MANUF_LOCATION,
        }
    }

    pub fn write(&mut self, record: ManufRecord) -> Result<(), FaultKind> {
        let mut record = record;
        record.magic = MANUF_MAGIC;
        record.record_length = ManufRecord::SIZE as u16;
        record.crc16 = crc16(&record.to_bytes()[..ManufRecord::SIZE - 2]);
        let bytes = record.to_bytes();

        for _ in 0..=WRITE_RETRIES {
            self.flash.erase_segment(self.base)?;
            self.flash.write_bytes(self.base, &bytes)?;
            if self.read().is_some() {
                return Ok(());
            }
        }
        Err(FaultKind::FlashWriteFailed)
    }

    pub fn read(&self) -> Option<ManufRecord> {
        let mut buf = [0u8; ManufRecord::SIZE];
        self.flash.read(self.base, &mut buf);
        let record = ManufRecord::from_bytes(&buf);
        if record.magic != MANUF_MAGIC {
            return None;
        }
        let crc_offset = record.record_length.checked_sub(2)? as usize;
        if crc_offset + 2 > buf.len() {
            return None;
        }
        let calc_crc = crc16(&buf[..crc_offset]);
        let stored_crc = u16::from_be_bytes([buf[crc_offset], buf[crc_offset + 1]]);
        if calc_crc != stored_crc {
            return None;
        }
        Some(record)
    }

    /// Baseline capacitance for `pad`, used by the excluded cap-sense
    /// driver to restore its per-pad baseline at boot. Returns 0 if no
    /// valid manufacturing record exists, matching the original's
    /// fall-through-to-zero behavior when manufacturing data is absent.
    pub fn pad_baseline(&self, pad: usize) -> u16 {
        self.read()
            .and_then(|r| r.pad_baseline.get(pad).copied())
            .unwrap_or(0)
    }
}
