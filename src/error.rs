//! Crate-wide error taxonomy (spec.md section 7).
//!
//! Nothing in this crate unwinds across exec routines: each component
//! stores its own error state and exposes it through a poll interface, and
//! the system exec loop never sees an exception. These types exist so that
//! error conditions stay a typed, inspectable value all the way out to the
//! OTA response byte or reboot reason that a caller ultimately observes.

/// One failure kind per spec.md section 7. Carried by the owning
/// component's own state, never propagated by unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Flash erase/write polled past the expected time. The caller
    /// proceeds; readback+CRC is the real verification.
    FlashTimeout,
    /// A record still fails its own CRC after 4 write retries.
    FlashWriteFailed,
    /// Modem frame response timed out (5 s transaction timeout).
    ModemFrameTimeout,
    /// Modem frame response failed framing or CRC validation.
    ModemFrameCrc,
    /// Session aborted after MAX_MODEM_POWER_CYCLES power-cycle retries.
    ModemCommError,
    /// 10-minute on-time expired without a network connection.
    ModemLinkTimeout,
    /// OTA message carried an opcode with no handler.
    OtaUnknownOpcode,
    /// OTA handler rejected its payload as out of range.
    OtaParameterInvalid,
    /// Firmware-upgrade loader failed; carries the specific stage.
    FwUpgradeFailed(FwUpgradeErrorKind),
    /// An unexpected interrupt vector fired (dummy ISR hit).
    CatastrophicFault,
}

/// Firmware-upgrade error codes, echoed verbatim to the cloud in byte 4 of
/// the OTA response data region (spec.md 4.11/4.7 numeric contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FwUpgradeErrorKind {
    None = 0,
    Modem = -1,
    SectionHeader = -2,
    Parameter = -3,
    Crc = -4,
    Timeout = -5,
}

impl FwUpgradeErrorKind {
    pub const fn code(self) -> i8 {
        self as i8
    }
}

/// Status byte placed at offset 3 of every OTA response data region
/// (spec.md section 4.10 "Response template").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OtaStatus {
    Success = 0x01,
    UnknownOpcode = 0xFE,
    Error = 0xFF,
}
