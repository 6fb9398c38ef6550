//! OTA message processor (spec.md section 4.10): two-phase retrieval from
//! the modem, opcode dispatch, response/delete sequencing, and the
//! post-processing ordering (reboot arming takes priority over a pending
//! GMT apply).

use crate::config::{
    MAX_OTA_MESSAGES_PER_SESSION, OTA_DATA_REGION_LEN, OTA_HEADER_LEN, OTA_PHASE1_MAX_PAYLOAD, OTA_RESPONSE_LEN,
    RESET_DEVICE_KEY,
};
use crate::error::{FaultKind, OtaStatus};
use crate::flash::Flash;
use crate::modem::{ModemCommand, ModemSession};
use crate::ota::opcodes::{build_response, GmtCandidate, GpsInterface, MemoryReader, OtaOpcode, OtaRequest, WaterAlgoParams};
use crate::rtc::WallClock;
use crate::storage::StorageEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtaState {
    Idle,
    SendPhase0,
    Phase0Wait,
    SendPhase1,
    Phase1Wait,
    Process,
    SendOtaResponse,
    SendOtaResponseWait,
    SendDelete,
    DeleteWait,
    CheckForMore,
    PostProcess,
    PostProcessSendResponse,
    PostProcessResponseWait,
    Done,
}

/// Set by the `FirmwareUpgrade` opcode handler to hand execution off to
/// the firmware-upgrade loader (spec.md section 4.11); the system exec
/// loop observes this and switches to driving the loader exclusively.
/// `initial_data` is whatever followed the 4-byte key in this same
/// phase-1 chunk: the 8-byte section header, and possibly the first few
/// bytes of firmware data if the chunk was large enough to carry them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUpgradeHandoff {
    pub msg_id: u16,
    pub initial_data: heapless::Vec<u8, OTA_PHASE1_MAX_PAYLOAD>,
}

pub struct OtaDispatcher {
    state: OtaState,
    messages_processed: u16,
    pending_len: usize,
    buf: heapless::Vec<u8, OTA_PHASE1_MAX_PAYLOAD>,
    pending_gmt: Option<GmtCandidate>,
    gmt_time_has_been_updated: bool,
    reboot_armed: bool,
    response_pending: heapless::Vec<u8, OTA_DATA_REGION_LEN>,
    /// The full 48-byte wire frame (16-byte message header + the 32-byte
    /// data region above), built only at the point of transmission so
    /// that `response_pending` stays a plain data-region buffer for
    /// `process_message`/`post_process` callers and their tests.
    tx_frame: heapless::Vec<u8, OTA_RESPONSE_LEN>,
    tx_frame_ready: bool,
    handler_data: [u8; 28],
    pub fw_upgrade_handoff: Option<FirmwareUpgradeHandoff>,
    pub water_algo: WaterAlgoParams,
}

impl OtaDispatcher {
    pub const fn new() -> Self {
        Self {
            state: OtaState::Idle,
            messages_processed: 0,
            pending_len: 0,
            buf: heapless::Vec::new(),
            pending_gmt: None,
            gmt_time_has_been_updated: false,
            reboot_armed: false,
            response_pending: heapless::Vec::new(),
            tx_frame: heapless::Vec::new(),
            tx_frame_ready: false,
            handler_data: [0u8; 28],
            fw_upgrade_handoff: None,
            water_algo: WaterAlgoParams::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, OtaState::Idle)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, OtaState::Done)
    }

    pub fn reboot_armed(&self) -> bool {
        self.reboot_armed
    }

    /// Returns the built 48-byte OTA-response frame exactly once, the
    /// tick it became ready — the caller (system exec) is expected to
    /// copy it into the outgoing payload buffer the modem session sends
    /// from before the session's next `exec()` call.
    pub fn take_tx_frame(&mut self) -> Option<&[u8]> {
        if self.tx_frame_ready {
            self.tx_frame_ready = false;
            Some(&self.tx_frame)
        } else {
            None
        }
    }

    /// Begins processing OTA messages pending on the modem (the data-
    /// message session calls this after its own send succeeds and the
    /// network is up).
    pub fn start(&mut self) {
        self.messages_processed = 0;
        self.state = OtaState::SendPhase0;
    }

    pub fn acknowledge_done(&mut self) {
        self.state = OtaState::Idle;
    }

    /// Drives the dispatcher forward by one exec tick.
    #[allow(clippy::too_many_arguments)]
    pub fn exec<F: Flash>(
        &mut self,
        session: &mut ModemSession,
        storage: &mut StorageEngine<F>,
        clock: &mut WallClock,
        gps: &mut impl GpsInterface,
        memory: &impl MemoryReader,
    ) {
        self.state = match self.state {
            OtaState::Idle | OtaState::Done => self.state,

            OtaState::SendPhase0 => {
                let header = ModemCommand::GetIncomingPartial.header_extra(0, 0);
                session.send_batch(ModemCommand::GetIncomingPartial, &header, 0);
                OtaState::Phase0Wait
            }
            OtaState::Phase0Wait => {
                if session.is_batch_complete() {
                    let response = session.last_ota_response();
                    self.pending_len = parse_phase0_len(response);
                    if self.pending_len > 0 {
                        OtaState::SendPhase1
                    } else {
                        OtaState::SendDelete
                    }
                } else if session.is_batch_error() {
                    OtaState::Done
                } else {
                    OtaState::Phase0Wait
                }
            }
            OtaState::SendPhase1 => {
                let request_len = self.pending_len.min(OTA_PHASE1_MAX_PAYLOAD);
                let header = ModemCommand::GetIncomingPartial.header_extra(0, request_len as u32);
                session.send_batch(ModemCommand::GetIncomingPartial, &header, request_len);
                OtaState::Phase1Wait
            }
            OtaState::Phase1Wait => {
                if session.is_batch_complete() {
                    self.buf.clear();
                    self.buf.extend_from_slice(session.last_ota_response()).ok();
                    OtaState::Process
                } else if session.is_batch_error() {
                    OtaState::Done
                } else {
                    OtaState::Phase1Wait
                }
            }
            OtaState::Process => {
                self.process_message(storage, clock, gps, memory);
                if self.fw_upgrade_handoff.is_some() {
                    OtaState::PostProcess
                } else if !self.response_pending.is_empty() {
                    OtaState::SendOtaResponse
                } else {
                    OtaState::SendDelete
                }
            }
            OtaState::SendOtaResponse => {
                self.build_tx_frame(clock, storage);
                let header = ModemCommand::SendData.header_extra(self.tx_frame.len() as u32, 0);
                session.send_batch(ModemCommand::SendData, &header, self.tx_frame.len());
                OtaState::SendOtaResponseWait
            }
            OtaState::SendOtaResponseWait => {
                if session.is_batch_complete() {
                    self.response_pending.clear();
                    OtaState::SendDelete
                } else if session.is_batch_error() {
                    OtaState::Done
                } else {
                    OtaState::SendOtaResponseWait
                }
            }
            OtaState::SendDelete => {
                session.send_batch(ModemCommand::DeleteIncoming, &[], 0);
                OtaState::DeleteWait
            }
            OtaState::DeleteWait => {
                if session.is_batch_complete() || session.is_batch_error() {
                    OtaState::CheckForMore
                } else {
                    OtaState::DeleteWait
                }
            }
            OtaState::CheckForMore => {
                self.messages_processed += 1;
                if self.messages_processed >= MAX_OTA_MESSAGES_PER_SESSION {
                    OtaState::PostProcess
                } else {
                    OtaState::SendPhase0
                }
            }
            OtaState::PostProcess => {
                self.post_process(clock);
                if !self.response_pending.is_empty() {
                    OtaState::PostProcessSendResponse
                } else {
                    OtaState::Done
                }
            }
            OtaState::PostProcessSendResponse => {
                self.build_tx_frame(clock, storage);
                let header = ModemCommand::SendData.header_extra(self.tx_frame.len() as u32, 0);
                session.send_batch(ModemCommand::SendData, &header, self.tx_frame.len());
                OtaState::PostProcessResponseWait
            }
            OtaState::PostProcessResponseWait => {
                if session.is_batch_complete() || session.is_batch_error() {
                    self.response_pending.clear();
                    OtaState::Done
                } else {
                    OtaState::PostProcessResponseWait
                }
            }
        };
    }

    /// Prepends the 16-byte message header (msg-id `0x03`, spec.md
    /// section 3) to the already-built 32-byte response data region,
    /// producing the 48-byte wire frame (invariant 5, spec.md section 8),
    /// and marks it ready for [`Self::take_tx_frame`].
    fn build_tx_frame<F: Flash>(&mut self, clock: &WallClock, storage: &StorageEngine<F>) {
        self.tx_frame.clear();
        self.tx_frame.extend_from_slice(&build_message_header(clock, storage)).ok();
        self.tx_frame.extend_from_slice(&self.response_pending).ok();
        self.tx_frame_ready = true;
        log::info!("OTA response frame ready, {} bytes", self.tx_frame.len());
    }

    fn process_message<F: Flash>(
        &mut self,
        storage: &mut StorageEngine<F>,
        clock: &mut WallClock,
        gps: &mut impl GpsInterface,
        memory: &impl MemoryReader,
    ) {
        let Some(request) = OtaRequest::parse(&self.buf) else {
            return;
        };
        let opcode_byte = request.opcode_byte;
        let msg_id = request.msg_id;
        let body = request.body;

        let Some(opcode) = OtaOpcode::from_byte(opcode_byte) else {
            log::warn!("unknown OTA opcode 0x{:02x}, msg_id={}", opcode_byte, msg_id);
            let resp = build_response(opcode_byte, msg_id, OtaStatus::UnknownOpcode as u8, &[]);
            self.response_pending.clear();
            self.response_pending.extend_from_slice(&resp).ok();
            return;
        };
        log::info!("dispatching OTA opcode 0x{:02x}, msg_id={}", opcode_byte, msg_id);

        let (status, data_len) = match opcode {
            OtaOpcode::GmtClockset => match self.handle_gmt_clockset(msg_id, body) {
                Some(pair) => pair,
                // A superseded-rejection response for the *previous*
                // candidate was already queued above; the newly staged
                // candidate itself gets no reply until post-processing.
                None => return,
            },
            OtaOpcode::LocalOffset => handle_local_offset(clock, body),
            OtaOpcode::ResetData => {
                storage.reset_data().ok();
                (OtaStatus::Success, 0)
            }
            OtaOpcode::ResetRedFlag => {
                storage.reset_red_flag();
                (OtaStatus::Success, 0)
            }
            OtaOpcode::ActivateDevice => {
                storage.force_activate();
                (OtaStatus::Success, 0)
            }
            OtaOpcode::SilenceDevice => {
                storage.silence();
                (OtaStatus::Success, 0)
            }
            OtaOpcode::SetTransmissionRate => {
                if let Some(&days) = body.first() {
                    storage.set_transmission_rate_days(days);
                    (OtaStatus::Success, 0)
                } else {
                    (OtaStatus::Error, 0)
                }
            }
            OtaOpcode::ResetDevice => {
                if body.len() >= 4 && &body[..4] == &RESET_DEVICE_KEY[..] {
                    self.reboot_armed = true;
                    (OtaStatus::Success, 0)
                } else {
                    (OtaStatus::Error, 0)
                }
            }
            OtaOpcode::ClockRequest => {
                let mut scratch = [0u8; 28];
                let len = write_clock_bytes(&mut scratch, clock, storage);
                self.handler_data[..len].copy_from_slice(&scratch[..len]);
                (OtaStatus::Success, len)
            }
            OtaOpcode::GpsRequest => {
                let mut scratch = [0u8; 28];
                let (status, len) = handle_gps_request(gps, body, &mut scratch);
                self.handler_data[..len].copy_from_slice(&scratch[..len]);
                (status, len)
            }
            OtaOpcode::SetGpsMeasParams => handle_gps_params(gps, body),
            OtaOpcode::SensorData => self.handle_sensor_data(body),
            OtaOpcode::FirmwareUpgrade => {
                if body.len() >= 4 && &body[..4] == &crate::config::FW_UPGRADE_KEY[..] {
                    let mut initial_data = heapless::Vec::new();
                    initial_data.extend_from_slice(&body[4..]).ok();
                    self.fw_upgrade_handoff = Some(FirmwareUpgradeHandoff { msg_id, initial_data });
                    return;
                }
                (OtaStatus::Error, 0)
            }
            OtaOpcode::MemoryRead => {
                let mut scratch = [0u8; 28];
                let (status, len) = handle_memory_read(memory, body, &mut scratch);
                self.handler_data[..len].copy_from_slice(&scratch[..len]);
                (status, len)
            }
        };

        let resp = build_response(opcode_byte, msg_id, status as u8, &self.handler_data[..data_len]);
        self.response_pending.clear();
        self.response_pending.extend_from_slice(&resp).ok();
    }

    /// Stages a GMT candidate (spec.md section 4.10 opcode `0x01`). Returns
    /// `Some` when the caller should build the normal immediate response
    /// (already-applied or malformed-body cases); returns `None` once the
    /// candidate is staged — the newly staged candidate gets no reply of
    /// its own, but if it superseded an earlier one, the rejection for
    /// that earlier candidate's msgId is queued here directly.
    fn handle_gmt_clockset(&mut self, msg_id: u16, body: &[u8]) -> Option<(OtaStatus, usize)> {
        if self.gmt_time_has_been_updated {
            return Some((OtaStatus::Success, 0));
        }
        if body.len() < 7 {
            return Some((OtaStatus::Error, 0));
        }
        let candidate = GmtCandidate {
            msg_id,
            sec: body[0],
            min: body[1],
            hour: body[2],
            days_from_epoch: u32::from_be_bytes([body[3], body[4], body[5], body[6]]),
        };
        if let Some(previous) = self.pending_gmt.replace(candidate) {
            let data = gmt_response_data(0xFF, &previous);
            let resp = build_response(OtaOpcode::GmtClockset.code(), previous.msg_id, OtaStatus::Success as u8, &data);
            self.response_pending.clear();
            self.response_pending.extend_from_slice(&resp).ok();
        }
        None
    }

    fn handle_sensor_data(&mut self, body: &[u8]) -> (OtaStatus, usize) {
        let Some(&sub_cmd) = body.first() else {
            return (OtaStatus::Error, 0);
        };
        let rest = &body[1..];
        match sub_cmd {
            0x03 => {
                if let Some(&limit) = rest.first() {
                    if self.water_algo.set_unknown_limit(limit) {
                        (OtaStatus::Success, 0)
                    } else {
                        (OtaStatus::Error, 0)
                    }
                } else {
                    (OtaStatus::Error, 0)
                }
            }
            0x04 => {
                self.water_algo.report_now = rest.first().copied().unwrap_or(0) != 0;
                (OtaStatus::Success, 0)
            }
            0x05 => {
                if rest.len() >= 2 {
                    self.water_algo.set_downspout_rate(u16::from_be_bytes([rest[0], rest[1]]));
                    (OtaStatus::Success, 0)
                } else {
                    (OtaStatus::Error, 0)
                }
            }
            0x06 => {
                if rest.len() >= 2 {
                    self.water_algo.water_limit = u16::from_be_bytes([rest[0], rest[1]]);
                    (OtaStatus::Success, 0)
                } else {
                    (OtaStatus::Error, 0)
                }
            }
            0x07 => {
                if rest.len() >= 2 {
                    self.water_algo.wake_time_secs = u16::from_be_bytes([rest[0], rest[1]]);
                    (OtaStatus::Success, 0)
                } else {
                    (OtaStatus::Error, 0)
                }
            }
            _ => (OtaStatus::Success, 0),
        }
    }

    /// Post-processing ordering (spec.md section 4.10): reboot-arming has
    /// priority; only otherwise is a pending GMT candidate applied.
    fn post_process(&mut self, clock: &mut WallClock) {
        if self.reboot_armed {
            log::info!("reboot armed, skipping pending GMT apply");
            return;
        }
        if let Some(candidate) = self.pending_gmt.take() {
            clock.apply_gmt(candidate.sec, candidate.min, candidate.hour, candidate.days_from_epoch);
            self.gmt_time_has_been_updated = true;
            log::info!("GMT candidate applied, msg_id={}", candidate.msg_id);
            let data = gmt_response_data(0x01, &candidate);
            let resp = build_response(OtaOpcode::GmtClockset.code(), candidate.msg_id, OtaStatus::Success as u8, &data);
            self.response_pending.clear();
            self.response_pending.extend_from_slice(&resp).ok();
        }
    }
}

impl Default for OtaDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the 8-byte GMT-clockset response data region (spec.md section
/// 4.11 scenario 3): accept/reject flag, then the echoed delta.
fn gmt_response_data(flag: u8, candidate: &GmtCandidate) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = flag;
    data[1] = candidate.sec;
    data[2] = candidate.min;
    data[3] = candidate.hour;
    data[4..8].copy_from_slice(&candidate.days_from_epoch.to_be_bytes());
    data
}

fn parse_phase0_len(response: &[u8]) -> usize {
    if response.len() < 4 {
        0
    } else {
        u32::from_be_bytes([response[0], response[1], response[2], response[3]]) as usize
    }
}

fn handle_local_offset(clock: &mut WallClock, body: &[u8]) -> (OtaStatus, usize) {
    if body.len() < 4 {
        return (OtaStatus::Error, 0);
    }
    let sec = body[0];
    let min = body[1];
    let hour = body[2];
    let offset = body[3] as i8;
    if sec >= 60 || min >= 60 || hour >= 24 {
        return (OtaStatus::Error, 0);
    }
    let new_hour = (clock.hour24 as i16 + offset as i16).rem_euclid(24) as u8;
    clock.hour24 = new_hour;
    (OtaStatus::Success, 0)
}

fn write_clock_bytes<F: Flash>(scratch: &mut [u8; 28], clock: &WallClock, storage: &StorageEngine<F>) -> usize {
    // 9 bytes per spec.md section 3: sec,min,hour,day,month,year%100,
    // storage-week, storage-day-of-week, reserved.
    let header = clock.to_header_bytes();
    scratch[..6].copy_from_slice(&header);
    scratch[6] = storage.current_week();
    scratch[7] = storage.day_of_week();
    scratch[8] = 0xA5;
    9
}

fn handle_gps_request(gps: &mut impl GpsInterface, body: &[u8], scratch: &mut [u8; 28]) -> (OtaStatus, usize) {
    match body.first() {
        Some(0) => {
            let len = gps.copy_last_fix(scratch);
            (OtaStatus::Success, len)
        }
        Some(1) => {
            gps.request_measurement();
            (OtaStatus::Success, 0)
        }
        _ => (OtaStatus::Error, 0),
    }
}

fn handle_gps_params(gps: &mut impl GpsInterface, body: &[u8]) -> (OtaStatus, usize) {
    if body.len() < 4 {
        return (OtaStatus::Error, 0);
    }
    let num_sats = body[0];
    let hdop = body[1];
    let min_on_time = u16::from_be_bytes([body[2], body[3]]);
    if num_sats > 16 || hdop > 100 || min_on_time > 900 {
        return (OtaStatus::Error, 0);
    }
    gps.set_measurement_params(num_sats, hdop, min_on_time);
    (OtaStatus::Success, 0)
}

/// Request body for opcode `0x1F` (spec.md section 4.10): `address` (u16,
/// big-endian), `count` of units, `width_bits` (8 or 16). Reads at most
/// 28 bytes — the OTA response data region only has that much room left
/// after the echoed opcode/msgId/status (spec.md invariant 5: the 48-byte
/// response never grows past the fixed header+data layout).
fn handle_memory_read(memory: &impl MemoryReader, body: &[u8], scratch: &mut [u8; 28]) -> (OtaStatus, usize) {
    if body.len() < 4 {
        return (OtaStatus::Error, 0);
    }
    let address = u16::from_be_bytes([body[0], body[1]]);
    let count = body[2];
    let width_bits = body[3];
    let unit_bytes = match width_bits {
        8 => 1,
        16 => 2,
        _ => return (OtaStatus::Error, 0),
    };
    let requested = count as usize * unit_bytes;
    if requested == 0 || requested > scratch.len() {
        return (OtaStatus::Error, 0);
    }
    let len = memory.read(address, count, width_bits, &mut scratch[..requested]);
    if len == 0 {
        (OtaStatus::Error, 0)
    } else {
        (OtaStatus::Success, len)
    }
}

/// Builds the 16-byte cloud message header (spec.md section 3) that
/// prefixes every outbound message; the OTA reply always uses msg-id
/// `0x03`.
fn build_message_header<F: Flash>(clock: &WallClock, storage: &StorageEngine<F>) -> [u8; OTA_HEADER_LEN] {
    let mut out = [0u8; OTA_HEADER_LEN];
    out[0] = crate::config::MSG_HEADER_START_BYTE;
    out[1] = crate::config::MSG_ID_OTA_REPLY;
    out[2] = crate::config::PRODUCT_ID;
    out[3..9].copy_from_slice(&clock.to_header_bytes());
    out[9] = crate::config::FW_VERSION_MAJOR;
    out[10] = crate::config::FW_VERSION_MINOR;
    let days_activated = storage.days_activated().to_be_bytes();
    out[11] = days_activated[0];
    out[12] = days_activated[1];
    out[13] = storage.current_week();
    out[14] = storage.day_of_week();
    out[15] = crate::config::MSG_HEADER_RESERVED;
    out
}

pub fn map_fault(state_is_done_with_error: bool) -> Option<FaultKind> {
    if state_is_done_with_error {
        Some(FaultKind::ModemCommError)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimulatedFlash;

    struct FakeGps {
        fix: heapless::Vec<u8, 16>,
        measurement_requested: bool,
    }

    impl GpsInterface for FakeGps {
        fn copy_last_fix(&self, out: &mut [u8]) -> usize {
            let len = self.fix.len().min(out.len());
            out[..len].copy_from_slice(&self.fix[..len]);
            len
        }
        fn request_measurement(&mut self) {
            self.measurement_requested = true;
        }
        fn set_measurement_params(&mut self, _num_sats: u8, _hdop: u8, _min_on_time_secs: u16) {}
    }

    struct FakeMemory {
        bytes: [u8; 64],
    }

    impl MemoryReader for FakeMemory {
        fn read(&self, address: u16, count: u8, width_bits: u8, out: &mut [u8]) -> usize {
            let unit_bytes = (width_bits / 8) as usize;
            let len = (count as usize * unit_bytes).min(out.len());
            let start = address as usize;
            if start + len > self.bytes.len() {
                return 0;
            }
            out[..len].copy_from_slice(&self.bytes[start..start + len]);
            len
        }
    }

    fn fake_memory() -> FakeMemory {
        let mut bytes = [0u8; 64];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        FakeMemory { bytes }
    }

    fn storage() -> StorageEngine<SimulatedFlash<{ 5 * 1024 }>> {
        StorageEngine::new(SimulatedFlash::new(crate::storage::WEEKLY_LOG_BASE))
    }

    #[test]
    fn unknown_opcode_gets_fe_status() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        dispatcher.buf.extend_from_slice(&[0x77, 0x00, 0x01]).unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        assert_eq!(dispatcher.response_pending[3], OtaStatus::UnknownOpcode as u8);
    }

    #[test]
    fn activate_device_sets_storage_activated() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        dispatcher
            .buf
            .extend_from_slice(&[OtaOpcode::ActivateDevice.code(), 0x00, 0x01])
            .unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        assert!(storage.is_activated());
        assert_eq!(dispatcher.response_pending[3], OtaStatus::Success as u8);
    }

    #[test]
    fn reset_device_requires_exact_key() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        let mut msg = heapless::Vec::<u8, 16>::new();
        msg.extend_from_slice(&[OtaOpcode::ResetDevice.code(), 0, 1, 0xAA, 0x55, 0xCC, 0x33])
            .unwrap();
        dispatcher.buf.clear();
        dispatcher.buf.extend_from_slice(&msg).unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        assert!(dispatcher.reboot_armed());
    }

    #[test]
    fn firmware_upgrade_opcode_with_valid_key_hands_off() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        let mut msg = heapless::Vec::<u8, 32>::new();
        msg.extend_from_slice(&[OtaOpcode::FirmwareUpgrade.code(), 0, 1]).unwrap();
        msg.extend_from_slice(&crate::config::FW_UPGRADE_KEY).unwrap();
        msg.extend_from_slice(&[0xA5, 0x00, 0x00, 0xC0, 0x00, 0x2C, 0x12, 0x34]).unwrap();
        dispatcher.buf.clear();
        dispatcher.buf.extend_from_slice(&msg).unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        let handoff = dispatcher.fw_upgrade_handoff.as_ref().unwrap();
        assert_eq!(handoff.msg_id, 1);
        assert_eq!(&handoff.initial_data[..8], &[0xA5, 0x00, 0x00, 0xC0, 0x00, 0x2C, 0x12, 0x34]);
    }

    #[test]
    fn firmware_upgrade_opcode_with_bad_key_is_rejected() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        let mut msg = heapless::Vec::<u8, 16>::new();
        msg.extend_from_slice(&[OtaOpcode::FirmwareUpgrade.code(), 0, 1, 0, 0, 0, 0])
            .unwrap();
        dispatcher.buf.clear();
        dispatcher.buf.extend_from_slice(&msg).unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        assert!(dispatcher.fw_upgrade_handoff.is_none());
        assert_eq!(dispatcher.response_pending[3], OtaStatus::Error as u8);
    }

    #[test]
    fn gmt_clockset_ignored_once_already_applied() {
        let mut dispatcher = OtaDispatcher::new();
        dispatcher.gmt_time_has_been_updated = true;
        let (status, _) = dispatcher.handle_gmt_clockset(5, &[0, 0, 12, 0, 0, 0, 10]).unwrap();
        assert_eq!(status, OtaStatus::Success);
        assert!(dispatcher.pending_gmt.is_none());
    }

    #[test]
    fn newer_gmt_candidate_supersedes_older_one() {
        let mut dispatcher = OtaDispatcher::new();
        assert!(dispatcher.handle_gmt_clockset(1, &[0, 0, 1, 0, 0, 0, 5]).is_none());
        assert!(dispatcher.handle_gmt_clockset(2, &[0, 0, 2, 0, 0, 0, 6]).is_none());
        assert_eq!(dispatcher.pending_gmt.unwrap().msg_id, 2);
    }

    #[test]
    fn superseded_candidate_gets_immediate_rejection_reply() {
        let mut dispatcher = OtaDispatcher::new();
        dispatcher.handle_gmt_clockset(5, &[0, 0, 1, 0, 0, 0, 5]);
        dispatcher.handle_gmt_clockset(7, &[0, 0, 2, 0, 0, 0, 6]);
        let resp = &dispatcher.response_pending;
        assert_eq!(resp[0], OtaOpcode::GmtClockset.code());
        assert_eq!(u16::from_be_bytes([resp[1], resp[2]]), 5);
        assert_eq!(resp[3], OtaStatus::Success as u8);
        assert_eq!(resp[4], 0xFF);
        assert_eq!(resp[5], 0);
        assert_eq!(resp[6], 0);
        assert_eq!(resp[7], 1);
    }

    #[test]
    fn post_process_applies_gmt_when_not_rebooting() {
        let mut dispatcher = OtaDispatcher::new();
        let mut clock = WallClock::new();
        dispatcher.handle_gmt_clockset(1, &[0, 0, 12, 0, 0, 0, 5]);
        dispatcher.post_process(&mut clock);
        assert_eq!(clock.hour24, 12);
        assert!(dispatcher.gmt_time_has_been_updated);
        let resp = &dispatcher.response_pending;
        assert_eq!(u16::from_be_bytes([resp[1], resp[2]]), 1);
        assert_eq!(resp[4], 0x01);
    }

    #[test]
    fn post_process_skips_gmt_when_reboot_armed() {
        let mut dispatcher = OtaDispatcher::new();
        let mut clock = WallClock::new();
        dispatcher.reboot_armed = true;
        dispatcher.handle_gmt_clockset(1, &[0, 0, 12, 0, 0, 0, 5]);
        dispatcher.post_process(&mut clock);
        assert_eq!(clock.hour24, 0);
    }

    #[test]
    fn gmt_clockset_opcode_suppresses_the_normal_response_path() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        let mut msg = heapless::Vec::<u8, 16>::new();
        msg.extend_from_slice(&[OtaOpcode::GmtClockset.code(), 0, 9, 0, 0, 12, 0, 0, 0, 5])
            .unwrap();
        dispatcher.buf.clear();
        dispatcher.buf.extend_from_slice(&msg).unwrap();
        dispatcher.response_pending.clear();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        assert!(dispatcher.response_pending.is_empty());
        assert!(dispatcher.pending_gmt.is_some());
    }

    #[test]
    fn memory_read_copies_requested_bytes_into_response() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        // address=0x0004, count=8, width=8 bits
        dispatcher
            .buf
            .extend_from_slice(&[OtaOpcode::MemoryRead.code(), 0x00, 0x01, 0x00, 0x04, 0x08, 0x08])
            .unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        let resp = &dispatcher.response_pending;
        assert_eq!(resp[3], OtaStatus::Success as u8);
        assert_eq!(&resp[4..12], &[4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn memory_read_rejects_unsupported_width() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        dispatcher
            .buf
            .extend_from_slice(&[OtaOpcode::MemoryRead.code(), 0x00, 0x01, 0x00, 0x00, 0x02, 0x20])
            .unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        assert_eq!(dispatcher.response_pending[3], OtaStatus::Error as u8);
    }

    #[test]
    fn memory_read_rejects_out_of_range_address() {
        let mut dispatcher = OtaDispatcher::new();
        let mut storage = storage();
        let mut clock = WallClock::new();
        let mut gps = FakeGps {
            fix: heapless::Vec::new(),
            measurement_requested: false,
        };
        dispatcher
            .buf
            .extend_from_slice(&[OtaOpcode::MemoryRead.code(), 0x00, 0x01, 0xFF, 0xF0, 0x04, 0x08])
            .unwrap();
        dispatcher.process_message(&mut storage, &mut clock, &mut gps, &fake_memory());
        assert_eq!(dispatcher.response_pending[3], OtaStatus::Error as u8);
    }

    #[test]
    fn build_tx_frame_prepends_sixteen_byte_header() {
        let mut dispatcher = OtaDispatcher::new();
        let storage = storage();
        let clock = WallClock::new();
        dispatcher.response_pending.extend_from_slice(&[0xAA; OTA_DATA_REGION_LEN]).unwrap();
        dispatcher.build_tx_frame(&clock, &storage);
        let frame = dispatcher.take_tx_frame().unwrap();
        assert_eq!(frame.len(), OTA_RESPONSE_LEN);
        assert_eq!(frame[0], crate::config::MSG_HEADER_START_BYTE);
        assert_eq!(frame[1], crate::config::MSG_ID_OTA_REPLY);
        assert_eq!(&frame[OTA_HEADER_LEN..], &[0xAA; OTA_DATA_REGION_LEN][..]);
        assert!(dispatcher.take_tx_frame().is_none());
    }
}
