//! Data-message session (spec.md section 4.7): the per-send state machine
//! that grabs the modem, brings it up, sends one message, waits for
//! network link-up, hands off to the OTA dispatcher, then releases.

use crate::config::{CONNECT_TIMEOUT_RETRY_SECS, LINK_UP_TIMEOUT_SECS, MAX_MODEM_POWER_CYCLES};
use crate::modem::{ModemCommand, ModemPower, ModemRails, ModemSession};
use crate::ota::OtaDispatcher;
use crate::scheduler::{ScheduledMessage, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Grab,
    WaitForModemUp,
    SendMsg,
    SendMsgWait,
    WaitForLink,
    ProcessOTA,
    ProcessOTAWait,
    Release,
    ReleaseWait,
}

pub struct DataMessageSession {
    state: State,
    modem_reset_count: u8,
    payload_len: usize,
    status_poll_inflight: bool,
    pub comm_error: bool,
    pub connect_timeout: bool,
    /// Absolute `SystemTick` seconds at which a connect-timeout retry
    /// should fire (spec.md section 4.7: "arms one retry 12 hours
    /// later"). A new send request cancels this.
    pub pending_retry_at_secs: Option<u32>,
    /// Set for one exec tick whenever the scheduled-message mux hands
    /// over the *next* message of an in-progress session (spec.md section
    /// 4.8: "fetch the next prepared payload"); the caller must build that
    /// message's payload and call [`Self::set_payload_len`] before the
    /// following tick's `SendMsg` state runs.
    pub pending_continuation: Option<ScheduledMessage>,
}

impl DataMessageSession {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            modem_reset_count: 0,
            payload_len: 0,
            status_poll_inflight: false,
            comm_error: false,
            connect_timeout: false,
            pending_retry_at_secs: None,
            pending_continuation: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Begins a send; also cancels any pending connect-timeout retry
    /// (spec.md section 4.7: "new messages cancel the pending retry").
    pub fn request_send(&mut self, payload_len: usize) {
        self.payload_len = payload_len;
        self.modem_reset_count = 0;
        self.comm_error = false;
        self.connect_timeout = false;
        self.pending_retry_at_secs = None;
        self.state = State::Grab;
    }

    /// Overrides the payload length used by the next `SendMsg` state,
    /// called by the caller after observing [`Self::pending_continuation`].
    pub fn set_payload_len(&mut self, payload_len: usize) {
        self.payload_len = payload_len;
    }

    /// Arms a 12-hour connect-timeout retry if one isn't already pending.
    pub fn arm_connect_timeout_retry(&mut self, now_secs: u32) {
        if self.pending_retry_at_secs.is_none() {
            self.pending_retry_at_secs = Some(now_secs.wrapping_add(CONNECT_TIMEOUT_RETRY_SECS));
        }
    }

    pub fn is_retry_due(&self, now_secs: u32) -> bool {
        self.pending_retry_at_secs.is_some_and(|at| now_secs >= at)
    }

    /// Drives the session forward by one exec tick. `ota` and `scheduler`
    /// are driven by sibling exec calls (spec.md section 4.12's fixed exec
    /// order); this only observes their completion/output.
    pub fn exec<R: ModemRails>(
        &mut self,
        session: &mut ModemSession,
        power: &mut ModemPower,
        rails: &mut R,
        ota: &mut OtaDispatcher,
        scheduler: &mut Scheduler,
        now_secs: u32,
    ) {
        self.state = match self.state {
            State::Idle => State::Idle,

            State::Grab => {
                if session.grab() {
                    power.power_on(rails);
                    State::WaitForModemUp
                } else {
                    State::Grab
                }
            }

            State::WaitForModemUp => {
                if power.is_up() {
                    State::SendMsg
                } else {
                    State::WaitForModemUp
                }
            }

            State::SendMsg => {
                let mut header = heapless::Vec::<u8, 8>::new();
                header.extend_from_slice(&(self.payload_len as u32).to_be_bytes()).ok();
                session.send_batch(ModemCommand::SendData, &header, self.payload_len);
                State::SendMsgWait
            }

            State::SendMsgWait => self.on_send_result(session, power),

            State::WaitForLink => self.on_wait_for_link(session, power, now_secs),

            State::ProcessOTA => {
                ota.start();
                State::ProcessOTAWait
            }

            State::ProcessOTAWait => {
                if ota.is_done() {
                    ota.acknowledge_done();
                    match scheduler.get_next_message_to_transmit() {
                        Some(message) => {
                            self.pending_continuation = Some(message);
                            State::SendMsg
                        }
                        None => State::Release,
                    }
                } else {
                    State::ProcessOTAWait
                }
            }

            State::Release => {
                session.release();
                power.begin_shutdown();
                State::ReleaseWait
            }

            State::ReleaseWait => {
                power.drop_rails(rails);
                if power.is_up() {
                    State::ReleaseWait
                } else {
                    State::Idle
                }
            }
        };
    }

    fn on_send_result(&mut self, session: &mut ModemSession, power: &ModemPower) -> State {
        if session.is_batch_complete() {
            self.status_poll_inflight = false;
            if session.link_up() {
                State::ProcessOTA
            } else {
                State::WaitForLink
            }
        } else if session.is_batch_error() {
            self.on_batch_error(power)
        } else {
            State::SendMsgWait
        }
    }

    fn on_batch_error(&mut self, power: &ModemPower) -> State {
        let _ = power;
        self.modem_reset_count += 1;
        if self.modem_reset_count > MAX_MODEM_POWER_CYCLES {
            self.comm_error = true;
            State::Release
        } else {
            State::WaitForModemUp
        }
    }

    fn on_wait_for_link(&mut self, session: &mut ModemSession, power: &ModemPower, now_secs: u32) -> State {
        let _ = now_secs;
        if power.on_time_secs() >= LINK_UP_TIMEOUT_SECS {
            self.connect_timeout = true;
            return State::ProcessOTA;
        }
        if !self.status_poll_inflight {
            session.send_batch(ModemCommand::ModemStatus, &[], 0);
            self.status_poll_inflight = true;
            return State::WaitForLink;
        }
        if session.is_batch_complete() {
            self.status_poll_inflight = false;
            if session.link_up() {
                State::ProcessOTA
            } else {
                State::WaitForLink
            }
        } else if session.is_batch_error() {
            self.status_poll_inflight = false;
            State::WaitForLink
        } else {
            State::WaitForLink
        }
    }
}

impl Default for DataMessageSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeRails;
    impl ModemRails for FakeRails {
        fn set_gsm_dcdc(&mut self, _on: bool) {}
        fn set_gsm_en(&mut self, _on: bool) {}
        fn set_ls_vcc(&mut self, _on: bool) {}
        fn set_1v8_en(&mut self, _on: bool) {}
    }

    #[test]
    fn request_send_cancels_pending_retry() {
        let mut session = DataMessageSession::new();
        session.arm_connect_timeout_retry(0);
        assert!(session.pending_retry_at_secs.is_some());
        session.request_send(128);
        assert!(session.pending_retry_at_secs.is_none());
        assert!(!session.is_idle());
    }

    #[test]
    fn connect_timeout_retry_fires_twelve_hours_later() {
        let mut session = DataMessageSession::new();
        session.arm_connect_timeout_retry(1_000);
        assert!(!session.is_retry_due(1_000 + CONNECT_TIMEOUT_RETRY_SECS - 1));
        assert!(session.is_retry_due(1_000 + CONNECT_TIMEOUT_RETRY_SECS));
    }

    #[test]
    fn comm_error_set_after_exceeding_power_cycle_budget() {
        let mut session = DataMessageSession::new();
        let power = ModemPower::new();
        // First failure retries (power-cycle); second exceeds the budget
        // of MAX_MODEM_POWER_CYCLES = 1.
        let first = session.on_batch_error(&power);
        assert_eq!(first, State::WaitForModemUp);
        let second = session.on_batch_error(&power);
        assert_eq!(second, State::Release);
        assert!(session.comm_error);
    }

    #[test]
    fn idle_session_does_not_hold_the_modem() {
        let session = DataMessageSession::new();
        assert!(session.is_idle());
    }

    #[test]
    fn request_send_grabs_the_modem_and_raises_rails() {
        let mut session = ModemSession::new();
        let mut power = ModemPower::new();
        let mut rails = FakeRails;
        let mut ota = OtaDispatcher::new();
        let mut scheduler = Scheduler::new();
        let mut dms = DataMessageSession::new();

        dms.request_send(64);
        dms.exec(&mut session, &mut power, &mut rails, &mut ota, &mut scheduler, 0);

        assert!(session.is_allocated());
        assert_eq!(dms.state, State::WaitForModemUp);
    }
}
