//! Core firmware for the AfridevV2 solar/battery handpump water-usage
//! monitor (spec.md section 1).
//!
//! This crate is the portable half of the firmware: every state machine
//! named in spec.md sections 4.1-4.12, with the MCU HAL (clock/pin init,
//! watchdog register, ADC, UART ISRs, cap-sense driver, water-volume
//! algorithm, NMEA parser) expressed as traits an integrator supplies
//! rather than wired here. [`system_exec::SystemExec`] is the orchestrator
//! that ties every module together in the fixed exec order spec.md
//! section 4.12 describes; everything else is usable standalone for
//! testing or for an integrator who wants finer-grained control.
#![no_std]

pub mod app_record;
pub mod config;
pub mod crc16;
pub mod critical_section;
pub mod error;
pub mod flash;
pub mod fw_upgrade;
pub mod gps;
pub mod manuf_record;
pub mod message_session;
pub mod modem;
pub mod ota;
pub mod rtc;
pub mod scheduler;
pub mod storage;
pub mod system_exec;
