//! Modem UART framer (spec.md section 4.4).
//!
//! TX is driven byte-by-byte by the UART-TX-ready interrupt; RX is driven
//! byte-by-byte by the UART-RX-byte-received interrupt. The ISR itself —
//! register-level UART access — is an excluded MCU HAL concern (spec.md
//! section 1); what lives here is the pure state those ISRs advance:
//! [`TxFramer::next_byte`] is called once per TX-ready interrupt and
//! [`RxFramer::on_byte`] once per received byte, so this module is
//! testable without a real UART.

use crate::crc16::crc16;
use crate::error::FaultKind;
use crate::modem::commands::ModemCommand;

pub const TX_START_BYTE: u8 = 0x3C;
pub const TX_END_BYTE: u8 = 0x3B;
pub const RX_START_BYTE: u8 = 0x3E;
pub const RX_END_BYTE: u8 = 0x3B;

/// Maximum framed TX size: 9-byte header + up to 512-byte write payload +
/// 2 CRC bytes + start/end.
pub const MAX_TX_FRAME: usize = 9 + 512 + 2 + 2;
/// ISR RX buffer size (spec.md section 4.4: "528-byte ISR buffer").
pub const ISR_RX_BUF_SIZE: usize = 528;

/// Byte position within a TX frame, tagged the way spec.md's table names
/// the states (`SendStart -> Header[i] -> Payload[i] -> CrcHi -> CrcLo ->
/// SendStop -> Disable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    SendStart,
    Header { index: usize },
    Payload { index: usize },
    CrcHi,
    CrcLo,
    SendStop,
    Disable,
}

/// Transmits one pre-built frame one byte at a time, as the TX-ready ISR
/// would drive it.
pub struct TxFramer {
    frame: heapless::Vec<u8, MAX_TX_FRAME>,
    header_len: usize,
    pos: usize,
}

impl TxFramer {
    /// Builds `<0x3C><cmd><header_extra><payload><crcHi><crcLo><0x3B>` and
    /// positions the cursor at the start byte.
    pub fn new(cmd: ModemCommand, header_extra: &[u8], payload: &[u8]) -> Self {
        let mut frame = heapless::Vec::new();
        frame.push(TX_START_BYTE).ok();
        frame.push(cmd.code()).ok();
        frame.extend_from_slice(header_extra).ok();
        frame.extend_from_slice(payload).ok();
        let crc = crc16(&frame[1..]);
        frame.extend_from_slice(&crc.to_be_bytes()).ok();
        frame.push(TX_END_BYTE).ok();
        Self {
            frame,
            header_len: 1 + header_extra.len(),
            pos: 0,
        }
    }

    pub fn state(&self) -> TxState {
        if self.pos == 0 {
            return TxState::SendStart;
        }
        if self.pos >= self.frame.len() {
            return TxState::Disable;
        }
        if self.pos == self.frame.len() - 1 {
            return TxState::SendStop;
        }
        if self.pos == self.frame.len() - 3 {
            return TxState::CrcHi;
        }
        if self.pos == self.frame.len() - 2 {
            return TxState::CrcLo;
        }
        if self.pos <= self.header_len {
            TxState::Header { index: self.pos - 1 }
        } else {
            TxState::Payload {
                index: self.pos - 1 - self.header_len,
            }
        }
    }

    /// Called once per TX-ready interrupt. Returns the next byte to push
    /// into the UART data register, or `None` once the frame (including
    /// the trailing end byte) has been fully sent.
    pub fn next_byte(&mut self) -> Option<u8> {
        let byte = self.frame.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.frame.len()
    }
}

/// Accumulates a modem response one byte at a time, as the RX-byte ISR
/// would drive it: discard bytes until the start byte, then accumulate
/// until either `expected_len` bytes have arrived or the buffer is full.
pub struct RxFramer {
    buf: heapless::Vec<u8, ISR_RX_BUF_SIZE>,
    seen_start: bool,
    expected_len: usize,
    complete: bool,
}

impl RxFramer {
    pub fn new(expected_len: usize) -> Self {
        Self {
            buf: heapless::Vec::new(),
            seen_start: false,
            expected_len,
            complete: false,
        }
    }

    /// Called once per received byte.
    pub fn on_byte(&mut self, byte: u8) {
        if self.complete {
            return;
        }
        if !self.seen_start {
            if byte != RX_START_BYTE {
                return;
            }
            self.seen_start = true;
        }
        if self.buf.push(byte).is_err() {
            self.complete = true;
            return;
        }
        if self.buf.len() >= self.expected_len || self.buf.is_full() {
            self.complete = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Post-receive validation, run from the exec context rather than the ISR
/// (spec.md section 4.4, the five numbered checks).
pub fn validate_response(sent_cmd: ModemCommand, response: &[u8], expected_len: usize) -> Result<(), FaultKind> {
    if response.len() != expected_len {
        return Err(FaultKind::ModemFrameCrc);
    }
    if response.first().copied() != Some(RX_START_BYTE) {
        return Err(FaultKind::ModemFrameCrc);
    }
    if response.last().copied() != Some(RX_END_BYTE) {
        return Err(FaultKind::ModemFrameCrc);
    }
    if response.get(1).copied() != Some(sent_cmd.code()) {
        return Err(FaultKind::ModemFrameCrc);
    }
    let crc_region = &response[1..response.len() - 3];
    let received_crc = u16::from_be_bytes([response[response.len() - 3], response[response.len() - 2]]);
    if crc16(crc_region) != received_crc {
        return Err(FaultKind::ModemFrameCrc);
    }
    Ok(())
}

/// One outstanding command transaction: send, wait for a response, retry
/// on framing/CRC failure or timeout, up to `MODEM_CMD_MAX_RETRIES`
/// (spec.md section 4.4).
pub struct CommandTransaction {
    cmd: ModemCommand,
    header_extra: heapless::Vec<u8, 8>,
    payload_len: usize,
    retries: u8,
    elapsed_secs: u32,
    failed: bool,
}

impl CommandTransaction {
    pub fn new(cmd: ModemCommand, header_extra: &[u8], payload_len: usize) -> Self {
        let mut stored = heapless::Vec::new();
        stored.extend_from_slice(header_extra).ok();
        Self {
            cmd,
            header_extra: stored,
            payload_len,
            retries: 0,
            elapsed_secs: 0,
            failed: false,
        }
    }

    pub fn new_tx_framer(&self, payload: &[u8]) -> TxFramer {
        TxFramer::new(self.cmd, &self.header_extra, payload)
    }

    pub fn new_rx_framer(&self) -> Option<RxFramer> {
        self.cmd
            .expected_response_len(self.payload_len)
            .map(RxFramer::new)
    }

    /// Called once per second of waiting; returns true once the 5 s
    /// whole-transaction timeout has elapsed.
    pub fn tick_one_second(&mut self) -> bool {
        self.elapsed_secs += 1;
        self.elapsed_secs >= crate::config::MODEM_FRAME_TIMEOUT_SECS
    }

    /// Records a failed attempt (timeout or validation failure) and
    /// reports whether another retry is allowed.
    pub fn record_failure(&mut self) -> bool {
        self.elapsed_secs = 0;
        if self.retries >= crate::config::MODEM_CMD_MAX_RETRIES {
            self.failed = true;
            false
        } else {
            self.retries += 1;
            true
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }
}
