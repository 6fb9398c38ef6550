//! Modem power FSM (spec.md section 4.6).
//!
//! Raises the `GSM_DCDC`, `GSM_EN`, `LS_VCC`, `_1V8_EN` rails in order,
//! waits the post-power-on delay, then hands off to the session's ping
//! loop to confirm responsiveness. On shutdown, sends a power-off command
//! and waits for the modem to drain before dropping rails. The GPIO
//! register writes themselves are an excluded MCU HAL concern; this
//! module drives an abstract [`ModemRails`] in the documented order and
//! owns the pure timing/state.

const POWER_ON_DELAY_SECS: u32 = 3;
const DRAIN_DELAY_SECS: u32 = 2;

/// The four power rails named in spec.md section 6, raised/dropped in
/// this order.
pub trait ModemRails {
    fn set_gsm_dcdc(&mut self, on: bool);
    fn set_gsm_en(&mut self, on: bool);
    fn set_ls_vcc(&mut self, on: bool);
    fn set_1v8_en(&mut self, on: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    RaisingRails,
    WaitPowerOnDelay { elapsed_secs: u32 },
    ConfirmingPing,
    Up { on_time_secs: u32 },
    SendingPowerOff,
    WaitDrain { elapsed_secs: u32 },
}

pub struct ModemPower {
    state: PowerState,
}

impl ModemPower {
    pub const fn new() -> Self {
        Self {
            state: PowerState::Off,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        matches!(self.state, PowerState::Up { .. })
    }

    /// Seconds the modem has been powered on, used by the data-message
    /// session's 10-minute link-up timeout (spec.md section 4.7).
    pub fn on_time_secs(&self) -> u32 {
        match self.state {
            PowerState::Up { on_time_secs } => on_time_secs,
            _ => 0,
        }
    }

    pub fn power_on<R: ModemRails>(&mut self, rails: &mut R) {
        if self.state == PowerState::Off {
            rails.set_gsm_dcdc(true);
            rails.set_gsm_en(true);
            rails.set_ls_vcc(true);
            rails.set_1v8_en(true);
            self.state = PowerState::RaisingRails;
        }
    }

    /// Called once per exec tick (every 2 s, spec.md section 2) while
    /// powering on or up. `ping_confirmed` reflects whether the session's
    /// ping batch has succeeded this tick.
    pub fn exec(&mut self, tick_secs: u32, ping_confirmed: bool) {
        self.state = match self.state {
            PowerState::Off => PowerState::Off,
            PowerState::RaisingRails => PowerState::WaitPowerOnDelay { elapsed_secs: 0 },
            PowerState::WaitPowerOnDelay { elapsed_secs } => {
                let elapsed = elapsed_secs + tick_secs;
                if elapsed >= POWER_ON_DELAY_SECS {
                    PowerState::ConfirmingPing
                } else {
                    PowerState::WaitPowerOnDelay { elapsed_secs: elapsed }
                }
            }
            PowerState::ConfirmingPing => {
                if ping_confirmed {
                    PowerState::Up { on_time_secs: 0 }
                } else {
                    PowerState::ConfirmingPing
                }
            }
            PowerState::Up { on_time_secs } => PowerState::Up {
                on_time_secs: on_time_secs + tick_secs,
            },
            PowerState::SendingPowerOff => PowerState::WaitDrain { elapsed_secs: 0 },
            PowerState::WaitDrain { elapsed_secs } => {
                let elapsed = elapsed_secs + tick_secs;
                if elapsed >= DRAIN_DELAY_SECS {
                    PowerState::Off
                } else {
                    PowerState::WaitDrain { elapsed_secs: elapsed }
                }
            }
        };
    }

    pub fn begin_shutdown(&mut self) {
        self.state = PowerState::SendingPowerOff;
    }

    pub fn drop_rails<R: ModemRails>(&mut self, rails: &mut R) {
        if matches!(self.state, PowerState::Off) {
            rails.set_1v8_en(false);
            rails.set_ls_vcc(false);
            rails.set_gsm_en(false);
            rails.set_gsm_dcdc(false);
        }
    }
}

impl Default for ModemPower {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeRails {
        gsm_dcdc: bool,
        gsm_en: bool,
        ls_vcc: bool,
        v1v8_en: bool,
    }

    impl ModemRails for FakeRails {
        fn set_gsm_dcdc(&mut self, on: bool) {
            self.gsm_dcdc = on;
        }
        fn set_gsm_en(&mut self, on: bool) {
            self.gsm_en = on;
        }
        fn set_ls_vcc(&mut self, on: bool) {
            self.ls_vcc = on;
        }
        fn set_1v8_en(&mut self, on: bool) {
            self.v1v8_en = on;
        }
    }

    #[test]
    fn power_on_raises_all_rails() {
        let mut power = ModemPower::new();
        let mut rails = FakeRails::default();
        power.power_on(&mut rails);
        assert!(rails.gsm_dcdc && rails.gsm_en && rails.ls_vcc && rails.v1v8_en);
    }

    #[test]
    fn reaches_up_after_delay_and_ping() {
        let mut power = ModemPower::new();
        let mut rails = FakeRails::default();
        power.power_on(&mut rails);
        power.exec(2, false); // RaisingRails -> WaitPowerOnDelay
        power.exec(2, false);
        power.exec(2, false); // elapsed >= 3s -> ConfirmingPing
        assert_eq!(power.state(), PowerState::ConfirmingPing);
        power.exec(2, true);
        assert!(power.is_up());
    }

    #[test]
    fn shutdown_drains_then_drops_rails() {
        let mut power = ModemPower::new();
        let mut rails = FakeRails::default();
        power.power_on(&mut rails);
        power.exec(2, false);
        power.exec(2, false);
        power.exec(2, false);
        power.exec(2, true);
        power.begin_shutdown();
        power.exec(2, false);
        power.exec(2, false);
        assert_eq!(power.state(), PowerState::Off);
        power.drop_rails(&mut rails);
        assert!(!rails.gsm_dcdc);
    }
}
