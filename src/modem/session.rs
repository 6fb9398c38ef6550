//! Modem session manager (spec.md section 4.5): batches ping -> command ->
//! modem-status -> message-status, owns the modem and the shared scratch
//! buffer, and exposes the parsed state the data-message session and OTA
//! dispatcher poll.

use crate::error::FaultKind;
use crate::modem::commands::{MessageStatus, ModemCommand, ModemStatus};
use crate::modem::framer::{self, CommandTransaction, RxFramer, TxFramer};

/// Byte-level UART access. Register/ISR wiring is an excluded MCU HAL
/// concern (spec.md section 1); this crate only needs a place to push
/// outgoing bytes and pull incoming ones.
pub trait ModemUart {
    fn write_byte(&mut self, byte: u8);
    fn read_byte(&mut self) -> Option<u8>;
}

const SHARED_BUF_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Ping,
    Command,
    ModemStatusCmd,
    MessageStatusCmd,
}

enum BatchState {
    Idle,
    Running {
        step: Step,
        cmd: ModemCommand,
        header_extra: heapless::Vec<u8, 8>,
        payload_len: usize,
        txn: CommandTransaction,
        tx: Option<TxFramer>,
        rx: Option<RxFramer>,
    },
    Complete,
    Error,
}

pub struct ModemSession {
    batch: BatchState,
    allocated: bool,
    shared_buffer: [u8; SHARED_BUF_SIZE],
    last_modem_status: Option<ModemStatus>,
    last_message_status: Option<MessageStatus>,
    last_ota_response: heapless::Vec<u8, SHARED_BUF_SIZE>,
    comm_error: bool,
}

impl ModemSession {
    pub const fn new() -> Self {
        Self {
            batch: BatchState::Idle,
            allocated: false,
            shared_buffer: [0u8; SHARED_BUF_SIZE],
            last_modem_status: None,
            last_message_status: None,
            last_ota_response: heapless::Vec::new(),
            comm_error: false,
        }
    }

    pub fn grab(&mut self) -> bool {
        if self.allocated {
            false
        } else {
            self.allocated = true;
            true
        }
    }

    pub fn release(&mut self) {
        self.allocated = false;
        self.batch = BatchState::Idle;
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Raw access to the shared scratch buffer. Only valid while the
    /// session is not allocated (spec.md section 3: "the 'allocated' flag
    /// on the modem session is the sole gate to this lending").
    pub fn shared_buffer(&mut self) -> Option<&mut [u8; SHARED_BUF_SIZE]> {
        if self.allocated {
            None
        } else {
            Some(&mut self.shared_buffer)
        }
    }

    pub fn is_modem_up(&self, power_up: bool) -> bool {
        power_up && self.last_modem_status.is_some()
    }

    pub fn link_up(&self) -> bool {
        self.last_modem_status
            .map(|s| s.state.is_link_up())
            .unwrap_or(false)
    }

    pub fn link_up_error(&self) -> bool {
        self.last_modem_status
            .map(|s| s.state.is_link_up_error())
            .unwrap_or(false)
    }

    pub fn pending_ota_count(&self) -> u16 {
        self.last_message_status.map(|s| s.incoming.count).unwrap_or(0)
    }

    pub fn pending_ota_total_bytes(&self) -> u32 {
        self.last_message_status
            .map(|s| s.incoming.total_size)
            .unwrap_or(0)
    }

    pub fn last_ota_response(&self) -> &[u8] {
        &self.last_ota_response
    }

    /// Starts a batch: ping, then `cmd`, then modem-status, then
    /// message-status. Aborts immediately if any sub-command exceeds its
    /// retries.
    pub fn send_batch(&mut self, cmd: ModemCommand, header_extra: &[u8], payload_len: usize) {
        let mut stored = heapless::Vec::new();
        stored.extend_from_slice(header_extra).ok();
        self.batch = BatchState::Running {
            step: Step::Ping,
            cmd,
            header_extra: stored,
            payload_len,
            txn: CommandTransaction::new(ModemCommand::Ping, &[], 0),
            tx: None,
            rx: None,
        };
    }

    pub fn is_batch_complete(&self) -> bool {
        matches!(self.batch, BatchState::Complete)
    }

    pub fn is_batch_error(&self) -> bool {
        matches!(self.batch, BatchState::Error)
    }

    pub fn has_comm_error(&self) -> bool {
        self.comm_error
    }

    pub fn clear_comm_error(&mut self) {
        self.comm_error = false;
    }

    /// Drives the batch forward by one exec tick, pumping the UART and
    /// validating any completed response. `payload` is the caller's
    /// outgoing payload for the batch's primary command (ignored for the
    /// ping/status sub-commands).
    pub fn exec<U: ModemUart>(&mut self, uart: &mut U, payload: &[u8]) {
        let batch = core::mem::replace(&mut self.batch, BatchState::Idle);
        self.batch = match batch {
            BatchState::Running {
                step,
                cmd,
                header_extra,
                payload_len,
                mut txn,
                mut tx,
                mut rx,
            } => {
                let step_payload: &[u8] = if step == Step::Command { payload } else { &[] };

                if tx.is_none() && rx.is_none() {
                    tx = Some(txn.new_tx_framer(step_payload));
                }
                if let Some(framer) = tx.as_mut() {
                    while let Some(byte) = framer.next_byte() {
                        uart.write_byte(byte);
                    }
                    if framer.is_done() {
                        rx = txn.new_rx_framer();
                        tx = None;
                    }
                }
                if let Some(framer) = rx.as_mut() {
                    while let Some(byte) = uart.read_byte() {
                        framer.on_byte(byte);
                        if framer.is_complete() {
                            break;
                        }
                    }
                }

                let step_cmd = match step {
                    Step::Ping => ModemCommand::Ping,
                    Step::Command => cmd,
                    Step::ModemStatusCmd => ModemCommand::ModemStatus,
                    Step::MessageStatusCmd => ModemCommand::MessageStatus,
                };

                if let Some(framer) = &rx {
                    if framer.is_complete() {
                        let expected = step_cmd.expected_response_len(payload_len).unwrap_or(0);
                        match framer::validate_response(step_cmd, framer.bytes(), expected) {
                            Ok(()) => {
                                self.apply_response(step, framer.bytes());
                                match Self::next_step(step) {
                                    Some(next_step) => BatchState::Running {
                                        step: next_step,
                                        cmd,
                                        header_extra,
                                        payload_len,
                                        txn: CommandTransaction::new(
                                            Self::step_cmd(next_step, cmd),
                                            &header_extra,
                                            payload_len,
                                        ),
                                        tx: None,
                                        rx: None,
                                    },
                                    None => BatchState::Complete,
                                }
                            }
                            Err(_) => {
                                if txn.record_failure() {
                                    BatchState::Running {
                                        step,
                                        cmd,
                                        header_extra,
                                        payload_len,
                                        txn,
                                        tx: None,
                                        rx: None,
                                    }
                                } else {
                                    self.comm_error = true;
                                    BatchState::Error
                                }
                            }
                        }
                    } else {
                        BatchState::Running {
                            step,
                            cmd,
                            header_extra,
                            payload_len,
                            txn,
                            tx,
                            rx,
                        }
                    }
                } else {
                    BatchState::Running {
                        step,
                        cmd,
                        header_extra,
                        payload_len,
                        txn,
                        tx,
                        rx,
                    }
                }
            }
            other => other,
        };
    }

    /// Called once per second while a response is outstanding; advances
    /// the whole-transaction timeout (spec.md section 4.4).
    pub fn tick_one_second(&mut self) {
        if let BatchState::Running { txn, .. } = &mut self.batch {
            if txn.tick_one_second() && !txn.record_failure() {
                self.comm_error = true;
                self.batch = BatchState::Error;
            }
        }
    }

    fn step_cmd(step: Step, primary: ModemCommand) -> ModemCommand {
        match step {
            Step::Ping => ModemCommand::Ping,
            Step::Command => primary,
            Step::ModemStatusCmd => ModemCommand::ModemStatus,
            Step::MessageStatusCmd => ModemCommand::MessageStatus,
        }
    }

    fn next_step(step: Step) -> Option<Step> {
        match step {
            Step::Ping => Some(Step::Command),
            Step::Command => Some(Step::ModemStatusCmd),
            Step::ModemStatusCmd => Some(Step::MessageStatusCmd),
            Step::MessageStatusCmd => None,
        }
    }

    fn apply_response(&mut self, step: Step, bytes: &[u8]) {
        match step {
            Step::ModemStatusCmd => {
                self.last_modem_status = ModemStatus::parse(&bytes[2..bytes.len() - 3]);
            }
            Step::MessageStatusCmd => {
                self.last_message_status = MessageStatus::parse(&bytes[2..bytes.len() - 3]);
            }
            Step::Command => {
                if bytes.len() > 13 {
                    self.last_ota_response.clear();
                    self.last_ota_response
                        .extend_from_slice(&bytes[2..bytes.len() - 3])
                        .ok();
                }
            }
            Step::Ping => {}
        }
    }
}

impl Default for ModemSession {
    fn default() -> Self {
        Self::new()
    }
}

pub fn map_comm_error(has_error: bool) -> Option<FaultKind> {
    if has_error {
        Some(FaultKind::ModemCommError)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoopbackUart {
        tx_seen: heapless::Vec<u8, 32>,
        rx_queue: heapless::Vec<u8, 32>,
        rx_pos: usize,
    }

    impl LoopbackUart {
        fn new() -> Self {
            Self {
                tx_seen: heapless::Vec::new(),
                rx_queue: heapless::Vec::new(),
                rx_pos: 0,
            }
        }

        fn queue_good_response(&mut self, cmd: u8, body: &[u8]) {
            let mut resp = heapless::Vec::<u8, 32>::new();
            resp.push(0x3E).unwrap();
            resp.push(cmd).unwrap();
            resp.extend_from_slice(body).unwrap();
            let crc = crate::crc16::crc16(&resp[1..]);
            resp.extend_from_slice(&crc.to_be_bytes()).unwrap();
            resp.push(0x3B).unwrap();
            self.rx_queue = resp;
            self.rx_pos = 0;
        }
    }

    impl ModemUart for LoopbackUart {
        fn write_byte(&mut self, byte: u8) {
            self.tx_seen.push(byte).ok();
        }
        fn read_byte(&mut self) -> Option<u8> {
            let b = self.rx_queue.get(self.rx_pos).copied();
            if b.is_some() {
                self.rx_pos += 1;
            }
            b
        }
    }

    #[test]
    fn grab_then_release_frees_allocation() {
        let mut session = ModemSession::new();
        assert!(session.grab());
        assert!(!session.grab());
        session.release();
        assert!(session.grab());
    }

    #[test]
    fn shared_buffer_unavailable_while_allocated() {
        let mut session = ModemSession::new();
        session.grab();
        assert!(session.shared_buffer().is_none());
        session.release();
        assert!(session.shared_buffer().is_some());
    }

    #[test]
    fn ping_step_progresses_on_valid_response() {
        let mut session = ModemSession::new();
        session.send_batch(ModemCommand::Ping, &[], 0);
        let mut uart = LoopbackUart::new();
        uart.queue_good_response(ModemCommand::Ping.code(), &[0, 0]);
        session.exec(&mut uart, &[]);
        // Ping -> Command is the next step; batch must not be in Error.
        assert!(!session.is_batch_error());
    }
}
