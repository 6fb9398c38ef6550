//! Main cooperative loop (spec.md section 4.12).
//!
//! Every component elsewhere in this crate exposes its own `exec()` and
//! advances one step at a time; nothing here runs a state machine of its
//! own beyond the startup-message sequence and the reboot countdown.
//! [`SystemExec`] just calls the others in the fixed order spec.md
//! section 2/4.12 names, once per 0.5 s tick (watchdog tickle, cap-sense +
//! water-volume algorithm) and once per 4th tick (everything else).
//!
//! The cap-sense driver, the water-volume algorithm, the NMEA parser, and
//! the MCU register pokes for reboot/watchdog/rails/UART are all excluded
//! collaborators (spec.md section 1); this module reaches them only
//! through the [`WaterAlgorithm`], [`SystemReset`], [`MessageBuilder`],
//! and the sibling modules' own rail/UART/device traits.
//!
//! Two consolidations versus spec.md's pseudocode, both noted here rather
//! than in every call site: (1) `modem_cmd.exec()` and `modem_mgr.exec()`
//! are two distinct components in spec.md's listing but one type,
//! [`crate::modem::ModemSession`], in this crate — its `exec()` already
//! pumps the framer and advances the ping/command/status batch in a
//! single call, so the fixed order below calls it twice (bracketing the
//! data-message/OTA/ping-confirm work) rather than calling a separate
//! framer exec twice and a session exec once; (2) `gps_msg.exec()`,
//! `gps_power.exec()`, and `gps.exec()` are one call into
//! [`crate::gps::GpsSession::exec`], which already owns its internal power
//! FSM.

use crate::app_record::AppRecordStore;
use crate::config::{MODEM_SEND_TEST_TIMEOUT_SECS, OTA_PHASE1_MAX_PAYLOAD, STARTUP_MESSAGE_GAP_SECS};
use crate::flash::Flash;
use crate::fw_upgrade::{FwUpgradeLoader, ImageRegions, Watchdog};
use crate::gps::{GpsDevice, GpsRails, GpsSession};
use crate::message_session::DataMessageSession;
use crate::modem::{ModemCommand, ModemPower, ModemRails, ModemSession, ModemUart, PowerState};
use crate::ota::{MemoryReader, OtaDispatcher};
use crate::rtc::{SystemTick, WallClock};
use crate::scheduler::{ScheduledMessage, Scheduler};
use crate::storage::StorageEngine;

/// The excluded cap-sense driver and water-volume algorithm (spec.md
/// section 1: "cap-sense driver... water-volume algorithm"), ticked once
/// per half-second whenever neither the modem session nor the GPS session
/// holds the device (spec.md section 4.12's `!(modem_allocated ||
/// gps_active)` gate).
pub trait WaterAlgorithm {
    /// Takes one cap-sense reading and runs one algorithm tick, returning
    /// milliliters measured since the previous call.
    fn tick(&mut self) -> u32;
}

/// The reboot action itself (spec.md section 4.12: "disables interrupts,
/// powers down the modem, writes `WDTCTL = 0xDEAD`") is MCU-register
/// territory excluded per spec.md section 1.
pub trait SystemReset {
    fn reboot(&mut self);
}

/// Builds the wire payload for a scheduled or startup message into a
/// caller-owned scratch buffer, returning the number of bytes written.
/// Assembling the actual cloud-message body (water-log records, header
/// framing) from storage/clock/manufacturing state is the integrator's
/// job; this crate only decides *when* to send and hands the builder a
/// buffer to fill.
pub trait MessageBuilder {
    fn build_scheduled(&mut self, message: ScheduledMessage, buf: &mut [u8]) -> usize;
    fn build_modem_send_test(&mut self, buf: &mut [u8]) -> usize;
}

/// Reboot countdown applied to any `reboot_armed` trigger that doesn't
/// supply its own (spec.md section 4.12's `secondsTillReboot`); the
/// firmware-upgrade loader's own 20 s countdown (spec.md section 4.11) is
/// the only documented value, so the plain `ResetDevice` OTA opcode reuses
/// it here.
const DEFAULT_REBOOT_COUNTDOWN_SECS: i32 = crate::config::FW_UPGRADE_REBOOT_COUNTDOWN_SECS as i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Startup {
    SendTest,
    WaitTest { elapsed_secs: u32 },
    GapToFinalAssembly { elapsed_secs: u32 },
    SendFinalAssembly,
    WaitFinalAssembly,
    GapToAppRecord { elapsed_secs: u32 },
    WriteAppRecord,
    GapToMonthlyCheckIn { elapsed_secs: u32 },
    SendMonthlyCheckIn,
    WaitMonthlyCheckIn,
    Done,
}

/// Orchestrates every state machine in this crate. `F` is the flash
/// backend behind the weekly-log ring, `FA` the one behind the
/// application record, and `IF` the one behind the main/backup firmware
/// image region the upgrade loader writes — distinct type parameters
/// because spec.md section 4.1 treats them as independently addressed
/// flash handles even when a real target backs all three with the same
/// physical part.
pub struct SystemExec<F: Flash, FA: Flash, IF: Flash> {
    pub tick: SystemTick,
    pub clock: WallClock,
    pub storage: StorageEngine<F>,
    pub app_record: AppRecordStore<FA>,
    pub image_flash: IF,
    pub modem_session: ModemSession,
    pub modem_power: ModemPower,
    pub data_msg: DataMessageSession,
    pub ota: OtaDispatcher,
    pub scheduler: Scheduler,
    pub fw_upgrade: FwUpgradeLoader,
    pub gps: GpsSession,

    tx_payload: heapless::Vec<u8, OTA_PHASE1_MAX_PAYLOAD>,
    ping_inflight: bool,
    startup: Startup,
    reboot_armed: bool,
    seconds_till_reboot: i32,
}

impl<F: Flash, FA: Flash, IF: Flash> SystemExec<F, FA, IF> {
    pub fn new(storage_flash: F, app_record_flash: FA, image_flash: IF, image_regions: ImageRegions) -> Self {
        Self {
            tick: SystemTick::new(),
            clock: WallClock::new(),
            storage: StorageEngine::new(storage_flash),
            app_record: AppRecordStore::new(app_record_flash),
            image_flash,
            modem_session: ModemSession::new(),
            modem_power: ModemPower::new(),
            data_msg: DataMessageSession::new(),
            ota: OtaDispatcher::new(),
            scheduler: Scheduler::new(),
            fw_upgrade: FwUpgradeLoader::new(image_regions),
            gps: GpsSession::new(),
            tx_payload: heapless::Vec::new(),
            ping_inflight: false,
            startup: Startup::SendTest,
            reboot_armed: false,
            seconds_till_reboot: 0,
        }
    }

    pub fn reboot_armed(&self) -> bool {
        self.reboot_armed
    }

    /// Called from the RTC timer ISR every 0.5 s. Advances the seconds-
    /// since-boot counter and, on whole-second boundaries, the wall clock
    /// and the modem session's one-second timeout tick — both run outside
    /// the 4th-tick gate because they're driven by real elapsed time, not
    /// by the exec cadence.
    pub fn on_half_second_tick(&mut self) {
        self.tick.on_half_second_tick();
        if self.tick.half_seconds() % 2 == 0 {
            self.clock.on_second_tick();
            self.modem_session.tick_one_second();
        }
    }

    /// True every 4th half-second tick; the caller's main loop gates the
    /// heavier [`Self::exec_tick`] call on this the same way it gates
    /// [`Self::on_half_second_tick`] on the timer ISR.
    pub fn is_exec_tick(&self) -> bool {
        self.tick.is_exec_tick()
    }

    /// Runs once per half-second regardless of the exec-tick gate:
    /// tickles the watchdog, then — only when neither the modem session
    /// nor the GPS session holds the device — ticks the excluded cap-
    /// sense/water-volume collaborator and feeds its output into storage.
    pub fn run_fast_path<W: Watchdog, WA: WaterAlgorithm>(&mut self, watchdog: &mut W, water_algo: &mut WA) {
        watchdog.tickle();
        if !(self.modem_session.is_allocated() || self.gps.is_active()) {
            let ml = water_algo.tick();
            if ml > 0 {
                self.storage.add_water_ml(ml);
            }
        }
    }

    /// Runs the fixed exec order, once every 4th half-second tick (2 s).
    #[allow(clippy::too_many_arguments)]
    pub fn exec_tick<R, U, GR, GD, W, S, MB, MR>(
        &mut self,
        rails: &mut R,
        uart: &mut U,
        gps_rails: &mut GR,
        gps_device: &mut GD,
        watchdog: &mut W,
        reset: &mut S,
        builder: &mut MB,
        memory: &MR,
    ) where
        R: ModemRails,
        U: ModemUart,
        GR: GpsRails,
        GD: GpsDevice,
        W: Watchdog,
        S: SystemReset,
        MB: MessageBuilder,
        MR: MemoryReader,
    {
        const TICK_SECS: u32 = (crate::config::EXEC_TICK_DIVISOR * crate::config::TICK_PERIOD_MS / 1000) as u32;

        self.storage.exec(self.clock.hour24).ok();

        self.modem_session.exec(uart, &self.tx_payload);
        self.data_msg
            .exec(&mut self.modem_session, &mut self.modem_power, rails, &mut self.ota, &mut self.scheduler, self.tick.seconds());
        self.ota
            .exec(&mut self.modem_session, &mut self.storage, &mut self.clock, &mut self.gps, memory);
        if let Some(frame) = self.ota.take_tx_frame() {
            self.tx_payload.clear();
            self.tx_payload.extend_from_slice(frame).ok();
        }
        if let Some(message) = self.data_msg.pending_continuation.take() {
            self.continue_send(message, builder);
        }
        self.issue_ping_if_needed();
        self.modem_session.exec(uart, &self.tx_payload);
        let ping_confirmed = self.read_ping_result();
        self.modem_power.exec(TICK_SECS, ping_confirmed);

        self.gps.exec(gps_device, gps_rails, TICK_SECS);

        self.scheduler.exec(self.clock.hour24, self.clock.min);
        self.scheduler.absorb_storage_schedule(&mut self.storage.schedule);
        if self.scheduler.perform_gps_measurement {
            self.scheduler.perform_gps_measurement = false;
            self.gps.request_measurement();
        }
        if self.gps.has_fix() && !self.gps.is_active() {
            self.scheduler.set_gps_location_pending();
        }

        self.take_fw_upgrade_handoff();
        if !self.fw_upgrade.is_idle() {
            self.fw_upgrade
                .exec(&mut self.image_flash, &mut self.app_record, &mut self.modem_session, watchdog, TICK_SECS);
            if self.fw_upgrade.is_done() {
                self.fw_upgrade.acknowledge_done();
                self.arm_reboot(self.fw_upgrade.reboot_countdown_secs() as i32);
            }
        }
        if self.ota.reboot_armed() {
            self.arm_reboot(DEFAULT_REBOOT_COUNTDOWN_SECS);
        }

        if self.reboot_armed {
            self.seconds_till_reboot -= TICK_SECS as i32;
            if self.seconds_till_reboot <= 0 {
                reset.reboot();
            }
        }

        if self.data_msg.is_idle() {
            if let Some(message) = self.scheduler.get_next_message_to_transmit() {
                self.begin_send(message, builder);
            }
        }

        if !self.gps.is_active() {
            self.advance_startup(builder);
        }
    }

    fn arm_reboot(&mut self, countdown_secs: i32) {
        if !self.reboot_armed {
            self.reboot_armed = true;
            self.seconds_till_reboot = countdown_secs;
        }
    }

    /// The modem-power FSM's `ConfirmingPing` state (spec.md section 4.6)
    /// needs a ping batch run on its behalf; this issues one through
    /// whichever session already holds the modem (the data-message
    /// session always grabs it before powering on) if one isn't already
    /// running.
    fn issue_ping_if_needed(&mut self) {
        if !matches!(self.modem_power.state(), PowerState::ConfirmingPing) {
            self.ping_inflight = false;
            return;
        }
        if !self.ping_inflight {
            self.modem_session.send_batch(ModemCommand::Ping, &[], 0);
            self.ping_inflight = true;
        }
    }

    /// Reads back the outcome of a ping issued by [`Self::issue_ping_if_needed`]
    /// after the modem command framer has had a chance to pump it this tick.
    fn read_ping_result(&mut self) -> bool {
        if !self.ping_inflight {
            return false;
        }
        if self.modem_session.is_batch_complete() {
            self.ping_inflight = false;
            true
        } else if self.modem_session.is_batch_error() {
            self.ping_inflight = false;
            false
        } else {
            false
        }
    }

    fn take_fw_upgrade_handoff(&mut self) {
        if self.fw_upgrade.is_idle() {
            if let Some(handoff) = self.ota.fw_upgrade_handoff.take() {
                self.fw_upgrade.start(&handoff);
            }
        }
    }

    fn begin_send(&mut self, message: ScheduledMessage, builder: &mut impl MessageBuilder) {
        let len = self.fill_tx_payload(message, builder);
        self.data_msg.request_send(len);
    }

    /// Continues an already-grabbed session onto its next message (spec.md
    /// section 4.8's "fetch the next prepared payload"). Unlike
    /// [`Self::begin_send`] this must not call `request_send`: the session
    /// is mid-flight, not idle, and `request_send` would re-arm `State::Grab`
    /// against a modem it already holds.
    fn continue_send(&mut self, message: ScheduledMessage, builder: &mut impl MessageBuilder) {
        let len = self.fill_tx_payload(message, builder);
        self.data_msg.set_payload_len(len);
    }

    fn fill_tx_payload(&mut self, message: ScheduledMessage, builder: &mut impl MessageBuilder) -> usize {
        let mut buf = [0u8; OTA_PHASE1_MAX_PAYLOAD];
        let len = builder.build_scheduled(message, &mut buf);
        self.tx_payload.clear();
        self.tx_payload.extend_from_slice(&buf[..len]).ok();
        len
    }

    /// Startup-message sequencing (spec.md section 4.12): one Modem-Send-
    /// Test waiting up to 5 minutes for a cloud ack, then — each separated
    /// by a 10 s gap — Final-Assembly, the App-record write (only once
    /// Final-Assembly has gone out, as proof the application is healthy),
    /// and Monthly-Check-in.
    fn advance_startup(&mut self, builder: &mut impl MessageBuilder) {
        self.startup = match self.startup {
            Startup::SendTest => {
                if self.data_msg.is_idle() {
                    let mut buf = [0u8; OTA_PHASE1_MAX_PAYLOAD];
                    let len = builder.build_modem_send_test(&mut buf);
                    self.tx_payload.clear();
                    self.tx_payload.extend_from_slice(&buf[..len]).ok();
                    self.data_msg.request_send(len);
                    Startup::WaitTest { elapsed_secs: 0 }
                } else {
                    Startup::SendTest
                }
            }
            Startup::WaitTest { elapsed_secs } => {
                if self.data_msg.is_idle() || elapsed_secs >= MODEM_SEND_TEST_TIMEOUT_SECS {
                    Startup::GapToFinalAssembly { elapsed_secs: 0 }
                } else {
                    Startup::WaitTest {
                        elapsed_secs: elapsed_secs + 2,
                    }
                }
            }
            Startup::GapToFinalAssembly { elapsed_secs } => {
                if elapsed_secs >= STARTUP_MESSAGE_GAP_SECS {
                    Startup::SendFinalAssembly
                } else {
                    Startup::GapToFinalAssembly {
                        elapsed_secs: elapsed_secs + 2,
                    }
                }
            }
            Startup::SendFinalAssembly => {
                if self.data_msg.is_idle() {
                    self.begin_send(ScheduledMessage::FinalAssembly, builder);
                    Startup::WaitFinalAssembly
                } else {
                    Startup::SendFinalAssembly
                }
            }
            Startup::WaitFinalAssembly => {
                if self.data_msg.is_idle() {
                    Startup::GapToAppRecord { elapsed_secs: 0 }
                } else {
                    Startup::WaitFinalAssembly
                }
            }
            Startup::GapToAppRecord { elapsed_secs } => {
                if elapsed_secs >= STARTUP_MESSAGE_GAP_SECS {
                    Startup::WriteAppRecord
                } else {
                    Startup::GapToAppRecord {
                        elapsed_secs: elapsed_secs + 2,
                    }
                }
            }
            Startup::WriteAppRecord => {
                self.app_record.init().ok();
                Startup::GapToMonthlyCheckIn { elapsed_secs: 0 }
            }
            Startup::GapToMonthlyCheckIn { elapsed_secs } => {
                if elapsed_secs >= STARTUP_MESSAGE_GAP_SECS {
                    Startup::SendMonthlyCheckIn
                } else {
                    Startup::GapToMonthlyCheckIn {
                        elapsed_secs: elapsed_secs + 2,
                    }
                }
            }
            Startup::SendMonthlyCheckIn => {
                if self.data_msg.is_idle() {
                    self.begin_send(ScheduledMessage::MonthlyCheckIn, builder);
                    Startup::WaitMonthlyCheckIn
                } else {
                    Startup::SendMonthlyCheckIn
                }
            }
            Startup::WaitMonthlyCheckIn => {
                if self.data_msg.is_idle() {
                    Startup::Done
                } else {
                    Startup::WaitMonthlyCheckIn
                }
            }
            Startup::Done => Startup::Done,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimulatedFlash;
    use crate::fw_upgrade::ImageRegions;
    use crate::gps::{GpsDevice, GpsRails};
    use crate::modem::{ModemRails, ModemUart};

    struct FakeRails;
    impl ModemRails for FakeRails {
        fn set_gsm_dcdc(&mut self, _on: bool) {}
        fn set_gsm_en(&mut self, _on: bool) {}
        fn set_ls_vcc(&mut self, _on: bool) {}
        fn set_1v8_en(&mut self, _on: bool) {}
    }

    #[derive(Default)]
    struct FakeGpsRails {
        on: bool,
    }
    impl GpsRails for FakeGpsRails {
        fn set_gps_on_off(&mut self, on: bool) {
            self.on = on;
        }
        fn gps_on_ind(&self) -> bool {
            self.on
        }
    }

    #[derive(Default)]
    struct FakeGpsDevice;
    impl GpsDevice for FakeGpsDevice {
        fn got_gga(&mut self) -> bool {
            false
        }
        fn has_fix(&self) -> bool {
            false
        }
        fn copy_fix_bytes(&self, _out: &mut [u8]) -> usize {
            0
        }
    }

    #[derive(Default)]
    struct FakeWatchdog {
        tickles: u32,
    }
    impl Watchdog for FakeWatchdog {
        fn tickle(&mut self) {
            self.tickles += 1;
        }
    }

    #[derive(Default)]
    struct FakeReset {
        rebooted: bool,
    }
    impl SystemReset for FakeReset {
        fn reboot(&mut self) {
            self.rebooted = true;
        }
    }

    /// Never responds: every batch times out, so the modem session always
    /// reports a comm error rather than completing. Good enough to drive
    /// the exec loop without panicking; the sequencing tests below only
    /// check that [`SystemExec::exec_tick`] runs to completion and steps
    /// the startup sequence, not that a simulated modem actually answers.
    struct DeafUart;
    impl ModemUart for DeafUart {
        fn write_byte(&mut self, _byte: u8) {}
        fn read_byte(&mut self) -> Option<u8> {
            None
        }
    }

    struct NullBuilder;
    impl MessageBuilder for NullBuilder {
        fn build_scheduled(&mut self, _message: ScheduledMessage, _buf: &mut [u8]) -> usize {
            0
        }
        fn build_modem_send_test(&mut self, _buf: &mut [u8]) -> usize {
            0
        }
    }

    #[derive(Default)]
    struct NullMemory;
    impl MemoryReader for NullMemory {
        fn read(&self, _address: u16, _count: u8, _width_bits: u8, _out: &mut [u8]) -> usize {
            0
        }
    }

    type TestExec = SystemExec<SimulatedFlash<{ 5 * 1024 }>, SimulatedFlash<64>, SimulatedFlash<{ 24 * 1024 }>>;

    fn new_exec() -> TestExec {
        SystemExec::new(
            SimulatedFlash::new(crate::storage::WEEKLY_LOG_BASE),
            SimulatedFlash::new(crate::app_record::APR_LOCATION),
            SimulatedFlash::new(0x8000),
            ImageRegions {
                main_base: 0x8000,
                backup_base: 0xC000,
                backup_end: 0xC000 + 22 * 512,
                max_section_len: 22 * 512,
            },
        )
    }

    #[test]
    fn half_second_tick_advances_clock_once_per_second() {
        let mut exec = new_exec();
        exec.on_half_second_tick();
        assert_eq!(exec.clock.sec, 0);
        exec.on_half_second_tick();
        assert_eq!(exec.clock.sec, 1);
    }

    #[test]
    fn is_exec_tick_fires_every_fourth_half_second() {
        let mut exec = new_exec();
        let mut fires = 0;
        for _ in 0..8 {
            exec.on_half_second_tick();
            if exec.is_exec_tick() {
                fires += 1;
            }
        }
        assert_eq!(fires, 2);
    }

    #[test]
    fn fast_path_skips_water_algo_while_modem_is_allocated() {
        struct CountingAlgo(u32);
        impl WaterAlgorithm for CountingAlgo {
            fn tick(&mut self) -> u32 {
                self.0 += 1;
                1000
            }
        }

        let mut exec = new_exec();
        let mut watchdog = FakeWatchdog::default();
        let mut algo = CountingAlgo(0);

        exec.run_fast_path(&mut watchdog, &mut algo);
        assert_eq!(algo.0, 1);
        assert_eq!(watchdog.tickles, 1);

        exec.modem_session.grab();
        exec.run_fast_path(&mut watchdog, &mut algo);
        assert_eq!(algo.0, 1, "water-volume tick must not run while the modem session holds the device");
        assert_eq!(watchdog.tickles, 2, "the watchdog is tickled every half-second regardless");
    }

    #[test]
    fn startup_sequence_runs_to_completion_without_panicking() {
        let mut exec = new_exec();
        let mut rails = FakeRails;
        let mut gps_rails = FakeGpsRails::default();
        let mut gps_device = FakeGpsDevice;
        let mut watchdog = FakeWatchdog::default();
        let mut reset = FakeReset::default();
        let mut builder = NullBuilder;
        let mut uart = DeafUart;
        let memory = NullMemory;

        // A few hundred exec ticks (≈10 minutes) is enough to walk the
        // whole startup sequence even with every modem batch timing out.
        for _ in 0..400 {
            exec.exec_tick(&mut rails, &mut uart, &mut gps_rails, &mut gps_device, &mut watchdog, &mut reset, &mut builder, &memory);
        }
        assert!(!reset.rebooted);
    }

    #[test]
    fn reboot_arms_and_counts_down_to_a_forced_reset() {
        let mut exec = new_exec();
        exec.ota.start();
        // Force reboot_armed without running the whole dispatcher pipeline:
        // simulate the effect of a successfully processed ResetDevice opcode.
        exec.arm_reboot(4);
        assert!(exec.reboot_armed());

        let mut reset = FakeReset::default();
        exec.seconds_till_reboot -= 2;
        assert!(!(exec.seconds_till_reboot <= 0));
        exec.seconds_till_reboot -= 2;
        if exec.seconds_till_reboot <= 0 {
            reset.reboot();
        }
        assert!(reset.rebooted);
    }

    #[test]
    fn arm_reboot_is_idempotent_about_the_countdown() {
        let mut exec = new_exec();
        exec.arm_reboot(20);
        exec.seconds_till_reboot = 6;
        exec.arm_reboot(20);
        assert_eq!(exec.seconds_till_reboot, 6, "a second arm request must not reset an in-flight countdown");
    }
}
