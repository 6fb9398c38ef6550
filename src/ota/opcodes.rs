//! OTA opcode table and response/request shapes (spec.md section 4.10).

use crate::config::OTA_DATA_REGION_LEN;

/// Typed command set the OTA dispatcher understands. Kept as a plain enum
/// matched exhaustively by the dispatcher rather than a dynamic handler
/// table (spec.md section 9: no trait objects, no heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OtaOpcode {
    GmtClockset = 0x01,
    LocalOffset = 0x02,
    ResetData = 0x03,
    ResetRedFlag = 0x04,
    ActivateDevice = 0x05,
    SilenceDevice = 0x06,
    SetTransmissionRate = 0x07,
    ResetDevice = 0x08,
    ClockRequest = 0x0C,
    GpsRequest = 0x0D,
    SetGpsMeasParams = 0x0E,
    SensorData = 0x0F,
    FirmwareUpgrade = 0x10,
    MemoryRead = 0x1F,
}

impl OtaOpcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::GmtClockset),
            0x02 => Some(Self::LocalOffset),
            0x03 => Some(Self::ResetData),
            0x04 => Some(Self::ResetRedFlag),
            0x05 => Some(Self::ActivateDevice),
            0x06 => Some(Self::SilenceDevice),
            0x07 => Some(Self::SetTransmissionRate),
            0x08 => Some(Self::ResetDevice),
            0x0C => Some(Self::ClockRequest),
            0x0D => Some(Self::GpsRequest),
            0x0E => Some(Self::SetGpsMeasParams),
            0x0F => Some(Self::SensorData),
            0x10 => Some(Self::FirmwareUpgrade),
            0x1F => Some(Self::MemoryRead),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// One incoming OTA message, parsed from the phase-1 get-incoming-partial
/// payload: 1-byte opcode, 2-byte msgId, then opcode-specific bytes.
pub struct OtaRequest<'a> {
    pub opcode_byte: u8,
    pub msg_id: u16,
    pub body: &'a [u8],
}

impl<'a> OtaRequest<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }
        Some(Self {
            opcode_byte: bytes[0],
            msg_id: u16::from_be_bytes([bytes[1], bytes[2]]),
            body: &bytes[3..],
        })
    }
}

/// Builds the 32-byte OTA response data region (spec.md section 4.10
/// "Response template"): echoed opcode, echoed msgId, status, then up to
/// 28 bytes of handler-specific data.
pub fn build_response(opcode_byte: u8, msg_id: u16, status: u8, data: &[u8]) -> [u8; OTA_DATA_REGION_LEN] {
    let mut out = [0u8; OTA_DATA_REGION_LEN];
    out[0] = opcode_byte;
    out[1..3].copy_from_slice(&msg_id.to_be_bytes());
    out[3] = status;
    let copy_len = data.len().min(OTA_DATA_REGION_LEN - 4);
    out[4..4 + copy_len].copy_from_slice(&data[..copy_len]);
    out
}

/// A staged GMT-clockset candidate (spec.md section 4.10 opcode `0x01`):
/// newer msgId wins, superseding any earlier staged candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GmtCandidate {
    pub msg_id: u16,
    pub sec: u8,
    pub min: u8,
    pub hour: u8,
    pub days_from_epoch: u32,
}

/// Last-known-fix / measurement-request surface the excluded GPS NMEA
/// parser exposes (spec.md section 1: "exposes 'got a GGA'/'have a fix'/
/// 'copy fix bytes'").
pub trait GpsInterface {
    /// Copies the last parsed GGA fix bytes into `out`, returning how many
    /// bytes were written (0 if no fix yet).
    fn copy_last_fix(&self, out: &mut [u8]) -> usize;
    fn request_measurement(&mut self);
    fn set_measurement_params(&mut self, num_sats: u8, hdop: u8, min_on_time_secs: u16);
}

/// Raw memory/register peek backing the `MemoryRead` OTA opcode (spec.md
/// section 4.10 `0x1F`). Touching actual MCU address space is an excluded
/// HAL concern (spec.md section 1); this crate only validates the request
/// and shapes the response.
pub trait MemoryReader {
    /// Copies `count` units of `width_bits` (8 or 16) starting at
    /// `address` into `out`, returning the number of bytes written (0 if
    /// the integrator refuses the address range).
    fn read(&self, address: u16, count: u8, width_bits: u8, out: &mut [u8]) -> usize;
}

/// OTA-settable parameters for the excluded water-volume algorithm
/// (spec.md section 1: black box exposing `hourly_volume_ml()` /
/// `water_present()`). The algorithm itself is out of scope; these are
/// just the tunables opcode `0x0F` is documented to set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterAlgoParams {
    pub unknown_limit_pct: u8,
    pub downspout_rate: u16,
    pub water_limit: u16,
    pub wake_time_secs: u16,
    pub report_now: bool,
}

impl WaterAlgoParams {
    pub const fn new() -> Self {
        Self {
            unknown_limit_pct: 0,
            downspout_rate: 200,
            water_limit: 0,
            wake_time_secs: 0,
            report_now: false,
        }
    }

    pub fn set_unknown_limit(&mut self, pct: u8) -> bool {
        if pct > 100 {
            return false;
        }
        self.unknown_limit_pct = pct;
        true
    }

    /// Clamped to `[200, 800]` (spec.md section 4.10 opcode `0x0F`).
    pub fn set_downspout_rate(&mut self, rate: u16) {
        self.downspout_rate = rate.clamp(200, 800);
    }
}

impl Default for WaterAlgoParams {
    fn default() -> Self {
        Self::new()
    }
}
