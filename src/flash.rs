//! Flash driver (spec.md section 4.1).
//!
//! A segment is 512 bytes; the erased cell value is `0xFF`; a byte may
//! only be written from `0xFF` to a lower value without a prior erase.
//! `write_int16`/`write_int32` serialize MSB-first — a wire-compatibility
//! contract with the cloud side (spec.md section 9, "Persistent storage
//! and endianness").
//!
//! The MCU register-level details (clock select, WRT/ERASE/LOCK bits,
//! interrupt masking) are an excluded HAL concern per spec.md section 1,
//! so this module exposes the driver as a trait over an abstract flash
//! device and ships two implementations: [`SimulatedFlash`], a RAM-backed
//! model used by every other module's tests, and [`Msp430Flash`], a thin
//! register-level backend gated behind the `mcu` feature and grounded
//! directly on `original_source/.../flash.c`.

use crate::error::FaultKind;

pub const SEGMENT_SIZE: usize = 512;
const ERASED_BYTE: u8 = 0xFF;

/// Abstract flash device: erase one 512-byte segment, write bytes
/// byte-by-byte, and the MSB-first 16/32-bit convenience writers.
pub trait Flash {
    /// Erase the 512-byte segment containing `addr`. A bounded timeout
    /// absorbs a stuck BUSY bit silently (spec.md: "a timeout is silently
    /// absorbed ... higher layers detect by reading back and CRC-checking").
    fn erase_segment(&mut self, addr: u32) -> Result<(), FaultKind>;

    /// Write `src` starting at `addr`, byte by byte, polling BUSY after
    /// each byte.
    fn write_bytes(&mut self, addr: u32, src: &[u8]) -> Result<(), FaultKind>;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, buf: &mut [u8]);

    /// Write a 16-bit value MSB-first.
    fn write_int16(&mut self, addr: u32, val: u16) -> Result<(), FaultKind> {
        self.write_bytes(addr, &val.to_be_bytes())
    }

    /// Write a 32-bit value MSB-first.
    fn write_int32(&mut self, addr: u32, val: u32) -> Result<(), FaultKind> {
        self.write_bytes(addr, &val.to_be_bytes())
    }
}

/// RAM-backed flash model used by host-side tests and by any module that
/// doesn't care about real register timing. Enforces the erase-to-0xFF /
/// monotonic-decrease write rule so tests exercise the same invariants the
/// real controller would.
pub struct SimulatedFlash<const N: usize> {
    base: u32,
    cells: [u8; N],
}

impl<const N: usize> SimulatedFlash<N> {
    pub const fn new(base: u32) -> Self {
        Self {
            base,
            cells: [ERASED_BYTE; N],
        }
    }

    fn offset(&self, addr: u32) -> usize {
        (addr - self.base) as usize
    }

    /// Direct read-only access, for tests that want to assert on raw bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.cells
    }
}

impl<const N: usize> Flash for SimulatedFlash<N> {
    fn erase_segment(&mut self, addr: u32) -> Result<(), FaultKind> {
        let start = self.offset(addr) / SEGMENT_SIZE * SEGMENT_SIZE;
        let end = (start + SEGMENT_SIZE).min(N);
        for b in &mut self.cells[start..end] {
            *b = ERASED_BYTE;
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: u32, src: &[u8]) -> Result<(), FaultKind> {
        let start = self.offset(addr);
        for (i, &byte) in src.iter().enumerate() {
            // A real cell can only move from 0xFF down, never back up; AND
            // with the existing value models that hardware behavior
            // without requiring an explicit erase-state check.
            self.cells[start + i] &= byte;
        }
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        let start = self.offset(addr);
        buf.copy_from_slice(&self.cells[start..start + buf.len()]);
    }
}

/// Register-level MSP430 flash controller backend (FCTL1/FCTL2/FCTL3),
/// ported from `original_source/.../flash.c`. Gated behind the `mcu`
/// feature since it pokes fixed memory-mapped addresses and is only
/// meaningful when actually cross-compiled for the target MCU.
#[cfg(feature = "mcu")]
pub struct Msp430Flash;

#[cfg(feature = "mcu")]
mod mcu_regs {
    pub const FCTL1: *mut u16 = 0x0128 as *mut u16;
    pub const FCTL2: *mut u16 = 0x012A as *mut u16;
    pub const FCTL3: *mut u16 = 0x012C as *mut u16;

    pub const FWKEY: u16 = 0xA500;
    pub const FSSEL_1: u16 = 0x0040;
    pub const FN1: u16 = 0x0002;
    pub const ERASE: u16 = 0x0002;
    pub const WRT: u16 = 0x0040;
    pub const LOCK: u16 = 0x0010;
    pub const BUSY: u16 = 0x0001;

    pub const ERASE_TIMEOUT_MS: u32 = 100;
    pub const WRITE_TIMEOUT_100US: u32 = 100;
}

#[cfg(feature = "mcu")]
impl Flash for Msp430Flash {
    fn erase_segment(&mut self, addr: u32) -> Result<(), FaultKind> {
        use mcu_regs::*;
        let mut timed_out = false;
        critical_section::with(|_| unsafe {
            core::ptr::write_volatile(FCTL2, FWKEY | FSSEL_1 | FN1);
            core::ptr::write_volatile(FCTL3, FWKEY);
            core::ptr::write_volatile(FCTL1, FWKEY | ERASE);

            // Dummy write to the segment to kick off the erase.
            core::ptr::write_volatile(addr as *mut u8, 0);

            let mut elapsed_ms = 0;
            while core::ptr::read_volatile(FCTL3) & BUSY != 0 {
                elapsed_ms += 1;
                if elapsed_ms > ERASE_TIMEOUT_MS {
                    timed_out = true;
                    break;
                }
            }

            core::ptr::write_volatile(FCTL1, FWKEY | LOCK);
        });
        if timed_out {
            return Err(FaultKind::FlashTimeout);
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: u32, src: &[u8]) -> Result<(), FaultKind> {
        use mcu_regs::*;
        let mut timed_out = false;
        critical_section::with(|_| unsafe {
            core::ptr::write_volatile(FCTL2, FWKEY | FSSEL_1 | FN1);
            core::ptr::write_volatile(FCTL3, FWKEY);
            core::ptr::write_volatile(FCTL1, FWKEY | WRT);

            for (i, &byte) in src.iter().enumerate() {
                core::ptr::write_volatile((addr as usize + i) as *mut u8, byte);

                let mut elapsed_100us = 0;
                while core::ptr::read_volatile(FCTL3) & BUSY != 0 {
                    elapsed_100us += 1;
                    if elapsed_100us > WRITE_TIMEOUT_100US {
                        timed_out = true;
                        break;
                    }
                }
            }

            core::ptr::write_volatile(FCTL1, FWKEY);
            core::ptr::write_volatile(FCTL1, FWKEY | LOCK);
        });
        if timed_out {
            return Err(FaultKind::FlashTimeout);
        }
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        unsafe {
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = core::ptr::read_volatile((addr as usize + i) as *const u8);
            }
        }
    }
}
