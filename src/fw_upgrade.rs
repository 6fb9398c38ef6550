//! Firmware-upgrade loader (spec.md section 4.11).
//!
//! On a validated `FirmwareUpgrade` OTA handoff (opcode `0x10`, key
//! `31 41 59 26`), this loader takes exclusive control of the modem
//! session for up to ten minutes: parse the 8-byte section header already
//! staged by the dispatcher, remap its address from main-image space into
//! backup-image space, erase the covered segments, fetch the remaining
//! section bytes from the modem in up to 512-byte chunks, write them into
//! the backup region, and CRC-verify the result before arming the
//! external bootloader's backup→main copy. Grounded on
//! `original_source/.../msgOtaUpgrade.c`'s `otaUpData` state machine.

use crate::app_record::AppRecordStore;
use crate::config::{FW_UPGRADE_MAX_DURATION_SECS, FW_UPGRADE_MODEM_MAX_RETRIES, FW_UPGRADE_REBOOT_COUNTDOWN_SECS};
use crate::error::FwUpgradeErrorKind;
use crate::flash::{Flash, SEGMENT_SIZE};
use crate::modem::{ModemCommand, ModemSession};
use crate::ota::FirmwareUpgradeHandoff;

const SECTION_HEADER_START_ID: u8 = 0xA5;
const SECTION_HEADER_LEN: usize = 8;
const MAX_CHUNK_LEN: usize = 512;

/// Pulses the external watchdog. Register-level wiring is an excluded MCU
/// HAL concern (spec.md section 1); the loader and the system exec loop
/// both just need "keep the dog fed" between long-running stages.
pub trait Watchdog {
    fn tickle(&mut self);
}

/// Main-image / backup-image address layout (spec.md section 4.11:
/// "remaps start-addr from 'main image' space to 'backup image' space").
/// Deriving these from linker symbols is an excluded HAL concern (spec.md
/// section 1); the caller supplies whatever its linker script produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRegions {
    pub main_base: u32,
    pub backup_base: u32,
    pub backup_end: u32,
    pub max_section_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectionHeader {
    /// Already remapped into backup-image space.
    start_addr: u32,
    length: u32,
    crc16: u16,
}

impl SectionHeader {
    fn parse(bytes: &[u8], regions: &ImageRegions) -> Option<Self> {
        if bytes.len() < SECTION_HEADER_LEN {
            return None;
        }
        if bytes[0] != SECTION_HEADER_START_ID || bytes[1] != 0 {
            return None;
        }
        let main_addr = u16::from_be_bytes([bytes[2], bytes[3]]) as u32;
        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as u32;
        let crc16 = u16::from_be_bytes([bytes[6], bytes[7]]);

        if length == 0 || length > regions.max_section_len {
            return None;
        }

        let start_addr = main_addr.wrapping_sub(regions.main_base).wrapping_add(regions.backup_base);
        let end_addr_inclusive = start_addr + length - 1;
        if start_addr < regions.backup_base || start_addr >= regions.backup_end {
            return None;
        }
        if end_addr_inclusive <= regions.backup_base || end_addr_inclusive > regions.backup_end {
            return None;
        }

        Some(Self { start_addr, length, crc16 })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    GetSectionInfo,
    EraseSection { next_offset: u32 },
    RequestChunk,
    RequestChunkWait,
    WriteChunk { chunk_len: usize },
    VerifySection,
    Done,
    Error(FwUpgradeErrorKind),
}

pub struct FwUpgradeLoader {
    state: State,
    regions: ImageRegions,
    header: Option<SectionHeader>,
    msg_id: u16,
    /// Leftover section-data bytes the dispatcher already had on hand in
    /// the handoff chunk, beyond the 8-byte header.
    carry_over: heapless::Vec<u8, MAX_CHUNK_LEN>,
    bytes_written: u32,
    elapsed_secs: u32,
    modem_retries: u8,
}

impl FwUpgradeLoader {
    pub const fn new(regions: ImageRegions) -> Self {
        Self {
            state: State::Idle,
            regions,
            header: None,
            msg_id: 0,
            carry_over: heapless::Vec::new(),
            bytes_written: 0,
            elapsed_secs: 0,
            modem_retries: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done | State::Error(_))
    }

    pub fn error(&self) -> Option<FwUpgradeErrorKind> {
        match self.state {
            State::Error(kind) => Some(kind),
            _ => None,
        }
    }

    /// Begins a loader run from a dispatcher handoff (spec.md section
    /// 4.10: "Firmware-upgrade short-circuits all of this and goes
    /// directly to PostProcess").
    pub fn start(&mut self, handoff: &FirmwareUpgradeHandoff) {
        log::info!("firmware upgrade handoff received, msg_id={}", handoff.msg_id);
        self.state = State::GetSectionInfo;
        self.msg_id = handoff.msg_id;
        self.header = None;
        self.carry_over.clear();
        self.carry_over.extend_from_slice(&handoff.initial_data).ok();
        self.bytes_written = 0;
        self.elapsed_secs = 0;
        self.modem_retries = 0;
    }

    pub fn acknowledge_done(&mut self) {
        self.state = State::Idle;
    }

    /// Drives the loader forward by one exec tick (spec.md section 2:
    /// every 2 s, same as the rest of the exec order). `tick_secs` feeds
    /// the 10-minute wall-clock budget.
    pub fn exec<F: Flash, FA: Flash, W: Watchdog>(
        &mut self,
        flash: &mut F,
        app_record: &mut AppRecordStore<FA>,
        session: &mut ModemSession,
        watchdog: &mut W,
        tick_secs: u32,
    ) {
        watchdog.tickle();

        if !matches!(self.state, State::Idle | State::Done | State::Error(_)) {
            self.elapsed_secs += tick_secs;
            if self.elapsed_secs >= FW_UPGRADE_MAX_DURATION_SECS {
                log::error!("firmware upgrade timed out after {} s", self.elapsed_secs);
                self.state = State::Error(FwUpgradeErrorKind::Timeout);
                return;
            }
        }

        self.state = match self.state {
            State::Idle | State::Done | State::Error(_) => self.state,

            State::GetSectionInfo => match SectionHeader::parse(&self.carry_over, &self.regions) {
                Some(header) => {
                    self.header = Some(header);
                    State::EraseSection { next_offset: 0 }
                }
                None => State::Error(FwUpgradeErrorKind::SectionHeader),
            },

            State::EraseSection { next_offset } => {
                let header = self.header.expect("header set before EraseSection");
                // Invalidate the app record before the first erase so a
                // half-erased region can never be mistaken for a valid
                // upgrade (spec.md section 4.11).
                if next_offset == 0 && app_record.write(0, 0).is_err() {
                    State::Error(FwUpgradeErrorKind::Parameter)
                } else if next_offset >= header.length {
                    self.bytes_written = self.write_carried_over_data(flash, &header);
                    State::RequestChunk
                } else {
                    match flash.erase_segment(header.start_addr + next_offset) {
                        Ok(()) => State::EraseSection {
                            next_offset: next_offset + SEGMENT_SIZE as u32,
                        },
                        Err(_) => State::Error(FwUpgradeErrorKind::Parameter),
                    }
                }
            }

            State::RequestChunk => {
                let header = self.header.expect("header set before RequestChunk");
                let remaining = header.length - self.bytes_written;
                if remaining == 0 {
                    State::VerifySection
                } else {
                    let request_len = (remaining as usize).min(MAX_CHUNK_LEN);
                    let offset = SECTION_HEADER_LEN as u32 + self.bytes_written;
                    let header = ModemCommand::GetIncomingPartial.header_extra(offset, request_len as u32);
                    session.send_batch(ModemCommand::GetIncomingPartial, &header, request_len);
                    State::RequestChunkWait
                }
            }

            State::RequestChunkWait => {
                if session.is_batch_complete() {
                    let chunk_len = session.last_ota_response().len();
                    State::WriteChunk { chunk_len }
                } else if session.is_batch_error() {
                    self.modem_retries += 1;
                    if self.modem_retries > FW_UPGRADE_MODEM_MAX_RETRIES {
                        State::Error(FwUpgradeErrorKind::Modem)
                    } else {
                        State::RequestChunk
                    }
                } else {
                    State::RequestChunkWait
                }
            }

            State::WriteChunk { chunk_len } => {
                let header = self.header.expect("header set before WriteChunk");
                if chunk_len == 0 {
                    State::Error(FwUpgradeErrorKind::Modem)
                } else {
                    let addr = header.start_addr + self.bytes_written;
                    let bytes = session.last_ota_response();
                    match flash.write_bytes(addr, &bytes[..chunk_len]) {
                        Ok(()) => {
                            self.bytes_written += chunk_len as u32;
                            self.modem_retries = 0;
                            State::RequestChunk
                        }
                        Err(_) => State::Error(FwUpgradeErrorKind::Parameter),
                    }
                }
            }

            State::VerifySection => {
                let header = self.header.expect("header set before VerifySection");
                let crc = self.verify_crc(flash, &header);
                if crc == header.crc16 {
                    log::info!("firmware upgrade verified, crc=0x{:04x}, arming reboot", crc);
                    match app_record.write(1, header.crc16) {
                        Ok(()) => State::Done,
                        Err(_) => State::Error(FwUpgradeErrorKind::Parameter),
                    }
                } else {
                    log::error!("firmware upgrade crc mismatch: expected=0x{:04x} got=0x{:04x}", header.crc16, crc);
                    State::Error(FwUpgradeErrorKind::Crc)
                }
            }
        };
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub fn reboot_countdown_secs(&self) -> u32 {
        FW_UPGRADE_REBOOT_COUNTDOWN_SECS
    }

    fn write_carried_over_data<F: Flash>(&self, flash: &mut F, header: &SectionHeader) -> u32 {
        if self.carry_over.len() <= SECTION_HEADER_LEN {
            return 0;
        }
        let data = &self.carry_over[SECTION_HEADER_LEN..];
        let len = data.len().min(header.length as usize);
        if len == 0 {
            return 0;
        }
        flash.write_bytes(header.start_addr, &data[..len]).ok();
        len as u32
    }

    /// CRC16 of the written region, read back from flash in fixed-size
    /// chunks (spec.md section 4.11: "CRC16 of the written region").
    fn verify_crc<F: Flash>(&self, flash: &F, header: &SectionHeader) -> u16 {
        let mut buf = [0u8; MAX_CHUNK_LEN];
        let mut remaining = header.length;
        let mut addr = header.start_addr;
        let mut running = 0u16;
        while remaining > 0 {
            let take = (remaining as usize).min(buf.len());
            flash.read(addr, &mut buf[..take]);
            running = crate::crc16::crc16_update(running, &buf[..take]);
            addr += take as u32;
            remaining -= take as u32;
        }
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimulatedFlash;

    #[derive(Default)]
    struct FakeWatchdog {
        tickles: u32,
    }
    impl Watchdog for FakeWatchdog {
        fn tickle(&mut self) {
            self.tickles += 1;
        }
    }

    fn regions() -> ImageRegions {
        ImageRegions {
            main_base: 0x8000,
            backup_base: 0x10000,
            backup_end: 0x10000 + 4096,
            max_section_len: 4096,
        }
    }

    fn section_header_bytes(main_addr: u16, length: u16, crc: u16) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = SECTION_HEADER_START_ID;
        bytes[1] = 0;
        bytes[2..4].copy_from_slice(&main_addr.to_be_bytes());
        bytes[4..6].copy_from_slice(&length.to_be_bytes());
        bytes[6..8].copy_from_slice(&crc.to_be_bytes());
        bytes
    }

    #[test]
    fn section_header_rejects_bad_start_id() {
        let mut bytes = section_header_bytes(0x8000, 64, 0);
        bytes[0] = 0;
        assert!(SectionHeader::parse(&bytes, &regions()).is_none());
    }

    #[test]
    fn section_header_remaps_main_to_backup_space() {
        let header = SectionHeader::parse(&section_header_bytes(0x8000, 64, 0), &regions()).unwrap();
        assert_eq!(header.start_addr, 0x10000);
        assert_eq!(header.length, 64);
    }

    #[test]
    fn section_header_rejects_length_over_budget() {
        let bytes = section_header_bytes(0x8000, 8000, 0);
        assert!(SectionHeader::parse(&bytes, &regions()).is_none());
    }

    #[test]
    fn section_header_rejects_out_of_region_start() {
        let bytes = section_header_bytes(0x7000, 64, 0);
        // main_addr below main_base remaps to a backup address below
        // backup_base, which the bounds check must reject.
        assert!(SectionHeader::parse(&bytes, &regions()).is_none());
    }

    /// Drives the loader through a whole section whose data arrives
    /// entirely in the handoff's `initial_data` (no modem round-trip
    /// needed), exercising erase, write, verify, and app-record arming.
    #[test]
    fn full_success_path_writes_verifies_and_arms_app_record() {
        const DATA_LEN: usize = 64;
        let data = [0x5Au8; DATA_LEN];
        let crc = crate::crc16::crc16(&data);

        let mut initial_data = heapless::Vec::<u8, { crate::config::OTA_PHASE1_MAX_PAYLOAD }>::new();
        initial_data
            .extend_from_slice(&section_header_bytes(0x8000, DATA_LEN as u16, crc))
            .unwrap();
        initial_data.extend_from_slice(&data).unwrap();

        let mut loader = FwUpgradeLoader::new(regions());
        loader.start(&FirmwareUpgradeHandoff { msg_id: 9, initial_data });

        let mut flash: SimulatedFlash<8192> = SimulatedFlash::new(0x10000);
        let mut app_record = AppRecordStore::new(SimulatedFlash::<64>::new(crate::app_record::APR_LOCATION));
        let mut session = ModemSession::new();
        let mut watchdog = FakeWatchdog::default();

        for _ in 0..20 {
            if loader.is_done() {
                break;
            }
            loader.exec(&mut flash, &mut app_record, &mut session, &mut watchdog, 2);
        }

        assert!(loader.is_done());
        assert!(loader.error().is_none(), "unexpected error: {:?}", loader.error());
        assert!(app_record.has_new_firmware());
        assert!(watchdog.tickles > 0);
    }

    #[test]
    fn crc_mismatch_reports_crc_error() {
        const DATA_LEN: usize = 32;
        let data = [0xAAu8; DATA_LEN];
        let wrong_crc = crate::crc16::crc16(&data).wrapping_add(1);

        let mut initial_data = heapless::Vec::<u8, { crate::config::OTA_PHASE1_MAX_PAYLOAD }>::new();
        initial_data
            .extend_from_slice(&section_header_bytes(0x8000, DATA_LEN as u16, wrong_crc))
            .unwrap();
        initial_data.extend_from_slice(&data).unwrap();

        let mut loader = FwUpgradeLoader::new(regions());
        loader.start(&FirmwareUpgradeHandoff { msg_id: 1, initial_data });

        let mut flash: SimulatedFlash<8192> = SimulatedFlash::new(0x10000);
        let mut app_record = AppRecordStore::new(SimulatedFlash::<64>::new(crate::app_record::APR_LOCATION));
        let mut session = ModemSession::new();
        let mut watchdog = FakeWatchdog::default();

        for _ in 0..20 {
            if loader.is_done() {
                break;
            }
            loader.exec(&mut flash, &mut app_record, &mut session, &mut watchdog, 2);
        }

        assert_eq!(loader.error(), Some(FwUpgradeErrorKind::Crc));
        assert!(!app_record.has_new_firmware());
    }

    #[test]
    fn bad_section_header_reports_section_header_error() {
        let mut initial_data = heapless::Vec::<u8, { crate::config::OTA_PHASE1_MAX_PAYLOAD }>::new();
        initial_data.extend_from_slice(&[0u8; 8]).unwrap();

        let mut loader = FwUpgradeLoader::new(regions());
        loader.start(&FirmwareUpgradeHandoff { msg_id: 2, initial_data });

        let mut flash: SimulatedFlash<8192> = SimulatedFlash::new(0x10000);
        let mut app_record = AppRecordStore::new(SimulatedFlash::<64>::new(crate::app_record::APR_LOCATION));
        let mut session = ModemSession::new();
        let mut watchdog = FakeWatchdog::default();

        loader.exec(&mut flash, &mut app_record, &mut session, &mut watchdog, 2);
        assert_eq!(loader.error(), Some(FwUpgradeErrorKind::SectionHeader));
    }
}
