//! GPS power FSM, message session, and top-level orchestration (spec.md
//! section 2's exec order: "gps_msg.exec(); gps_power.exec(); gps.exec()").
//!
//! NMEA parsing itself is an excluded collaborator (spec.md section 1:
//! "exposes 'got a GGA'/'have a fix'/'copy fix bytes'"); this module owns
//! only the orchestration around that black box — when to raise the
//! `GPS_ON_OFF` rail, how long to wait for a fix, and how the result is
//! handed to the OTA dispatcher (which consumes it through
//! [`crate::ota::GpsInterface`], implemented here by [`GpsSession`]).

use crate::ota::GpsInterface;

/// Fix/NMEA surface the excluded GPS parser exposes to this crate.
pub trait GpsDevice {
    /// True once a new GGA sentence has been parsed since the last call.
    fn got_gga(&mut self) -> bool;
    /// True once the parsed GGA carries a valid fix (not just a sentence).
    fn has_fix(&self) -> bool;
    /// Copies the raw fix bytes (as the cloud expects them) into `out`,
    /// returning the number of bytes written.
    fn copy_fix_bytes(&self, out: &mut [u8]) -> usize;
}

/// The `GPS_ON_OFF` / `GPS_ON_IND` GPIOs named in spec.md section 6.
pub trait GpsRails {
    fn set_gps_on_off(&mut self, on: bool);
    fn gps_on_ind(&self) -> bool;
}

const FIX_BUF_LEN: usize = 64;
const DEFAULT_MIN_ON_TIME_SECS: u16 = 120;
const MAX_ON_TIME_SECS: u32 = 900;

/// OTA-settable GPS measurement parameters (spec.md section 4.10 opcode
/// `0x0E`): validated by the dispatcher before being handed here, so this
/// struct only stores already-clamped values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsParams {
    pub num_sats: u8,
    pub hdop: u8,
    pub min_on_time_secs: u16,
}

impl GpsParams {
    pub const fn new() -> Self {
        Self {
            num_sats: 0,
            hdop: 0,
            min_on_time_secs: DEFAULT_MIN_ON_TIME_SECS,
        }
    }
}

impl Default for GpsParams {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerState {
    Off,
    RaisingRail,
    WaitOnInd { elapsed_secs: u32 },
    Up { on_time_secs: u32 },
}

/// Power FSM for the GPS module, structurally mirroring
/// [`crate::modem::power::ModemPower`]: raise the rail, wait for the
/// ready indicator, track on-time for the session's timeout.
struct GpsPower {
    state: PowerState,
}

impl GpsPower {
    const fn new() -> Self {
        Self { state: PowerState::Off }
    }

    fn is_up(&self) -> bool {
        matches!(self.state, PowerState::Up { .. })
    }

    fn is_off(&self) -> bool {
        matches!(self.state, PowerState::Off)
    }

    fn on_time_secs(&self) -> u32 {
        match self.state {
            PowerState::Up { on_time_secs } => on_time_secs,
            _ => 0,
        }
    }

    fn power_on<R: GpsRails>(&mut self, rails: &mut R) {
        if self.is_off() {
            rails.set_gps_on_off(true);
            self.state = PowerState::RaisingRail;
        }
    }

    fn power_off<R: GpsRails>(&mut self, rails: &mut R) {
        rails.set_gps_on_off(false);
        self.state = PowerState::Off;
    }

    fn exec<R: GpsRails>(&mut self, rails: &R, tick_secs: u32) {
        self.state = match self.state {
            PowerState::Off => PowerState::Off,
            PowerState::RaisingRail => PowerState::WaitOnInd { elapsed_secs: 0 },
            PowerState::WaitOnInd { elapsed_secs } => {
                if rails.gps_on_ind() {
                    PowerState::Up { on_time_secs: 0 }
                } else {
                    PowerState::WaitOnInd {
                        elapsed_secs: elapsed_secs + tick_secs,
                    }
                }
            }
            PowerState::Up { on_time_secs } => PowerState::Up {
                on_time_secs: on_time_secs + tick_secs,
            },
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    WaitForPower,
    WaitForFix,
    Done,
}

/// Top-level GPS orchestration: owns the power FSM, the requested-
/// measurement flag, the params an OTA command can tune, and the last
/// fix copied out of the excluded NMEA parser. Implements
/// [`GpsInterface`] so the OTA dispatcher can request a measurement or
/// read back the last fix without depending on this module directly.
pub struct GpsSession {
    power: GpsPower,
    state: SessionState,
    measurement_pending: bool,
    params: GpsParams,
    last_fix: heapless::Vec<u8, FIX_BUF_LEN>,
    have_fix: bool,
}

impl GpsSession {
    pub const fn new() -> Self {
        Self {
            power: GpsPower::new(),
            state: SessionState::Idle,
            measurement_pending: false,
            params: GpsParams::new(),
            last_fix: heapless::Vec::new(),
            have_fix: false,
        }
    }

    /// True whenever the GPS rail is up or a session is mid-flight — the
    /// system exec loop uses this to gate the cap-sense/water-algorithm
    /// tick and the UART mux (spec.md section 5: "only one of {modem
    /// session, GPS} may be active at a time").
    pub fn is_active(&self) -> bool {
        !matches!(self.state, SessionState::Idle) || !self.power.is_off()
    }

    pub fn has_fix(&self) -> bool {
        self.have_fix
    }

    /// Drives the GPS session forward by one exec tick.
    pub fn exec<D: GpsDevice, R: GpsRails>(&mut self, device: &mut D, rails: &mut R, tick_secs: u32) {
        self.power.exec(rails, tick_secs);

        self.state = match self.state {
            SessionState::Idle => {
                if self.measurement_pending {
                    self.measurement_pending = false;
                    self.power.power_on(rails);
                    SessionState::WaitForPower
                } else {
                    SessionState::Idle
                }
            }
            SessionState::WaitForPower => {
                if self.power.is_up() {
                    SessionState::WaitForFix
                } else {
                    SessionState::WaitForPower
                }
            }
            SessionState::WaitForFix => {
                if device.got_gga() && device.has_fix() {
                    self.have_fix = true;
                    self.last_fix.clear();
                    let mut buf = [0u8; FIX_BUF_LEN];
                    let len = device.copy_fix_bytes(&mut buf);
                    self.last_fix.extend_from_slice(&buf[..len]).ok();
                    SessionState::Done
                } else if self.power.on_time_secs() >= self.params.min_on_time_secs as u32
                    || self.power.on_time_secs() >= MAX_ON_TIME_SECS
                {
                    // Min on-time (or the hard cap) elapsed without a fix;
                    // give up for this session rather than draining the
                    // battery indefinitely.
                    SessionState::Done
                } else {
                    SessionState::WaitForFix
                }
            }
            SessionState::Done => {
                self.power.power_off(rails);
                SessionState::Idle
            }
        };
    }
}

impl Default for GpsSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GpsInterface for GpsSession {
    fn copy_last_fix(&self, out: &mut [u8]) -> usize {
        let len = self.last_fix.len().min(out.len());
        out[..len].copy_from_slice(&self.last_fix[..len]);
        len
    }

    fn request_measurement(&mut self) {
        self.measurement_pending = true;
    }

    fn set_measurement_params(&mut self, num_sats: u8, hdop: u8, min_on_time_secs: u16) {
        self.params = GpsParams {
            num_sats,
            hdop,
            min_on_time_secs,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRails {
        on: bool,
        ind: bool,
    }
    impl GpsRails for FakeRails {
        fn set_gps_on_off(&mut self, on: bool) {
            self.on = on;
            // Model the indicator following the rail one tick later.
            self.ind = on;
        }
        fn gps_on_ind(&self) -> bool {
            self.ind
        }
    }

    struct FakeDevice {
        gga_at_tick: Option<u32>,
        tick: u32,
        fix: [u8; 8],
    }
    impl GpsDevice for FakeDevice {
        fn got_gga(&mut self) -> bool {
            self.tick += 1;
            self.gga_at_tick == Some(self.tick)
        }
        fn has_fix(&self) -> bool {
            self.gga_at_tick == Some(self.tick)
        }
        fn copy_fix_bytes(&self, out: &mut [u8]) -> usize {
            out[..self.fix.len()].copy_from_slice(&self.fix);
            self.fix.len()
        }
    }

    #[test]
    fn idle_session_is_not_active() {
        let session = GpsSession::new();
        assert!(!session.is_active());
    }

    #[test]
    fn requested_measurement_powers_on_and_copies_fix() {
        let mut session = GpsSession::new();
        let mut rails = FakeRails { on: false, ind: false };
        let mut device = FakeDevice {
            gga_at_tick: Some(2),
            tick: 0,
            fix: [0xAA; 8],
        };

        session.request_measurement();
        assert!(session.is_active());

        for _ in 0..6 {
            session.exec(&mut device, &mut rails, 2);
        }

        assert!(session.has_fix());
        let mut out = [0u8; 8];
        let len = session.copy_last_fix(&mut out);
        assert_eq!(len, 8);
        assert_eq!(out, [0xAA; 8]);
        assert!(!session.is_active());
        assert!(!rails.on);
    }

    #[test]
    fn gives_up_after_min_on_time_without_a_fix() {
        let mut session = GpsSession::new();
        session.set_measurement_params(8, 50, 4);
        let mut rails = FakeRails { on: false, ind: false };
        let mut device = FakeDevice {
            gga_at_tick: None,
            tick: 0,
            fix: [0; 8],
        };

        session.request_measurement();
        for _ in 0..6 {
            session.exec(&mut device, &mut rails, 2);
        }

        assert!(!session.has_fix());
        assert!(!session.is_active());
    }

    #[test]
    fn set_measurement_params_stores_validated_values() {
        let mut session = GpsSession::new();
        session.set_measurement_params(12, 30, 600);
        assert_eq!(session.params.num_sats, 12);
        assert_eq!(session.params.min_on_time_secs, 600);
    }
}
