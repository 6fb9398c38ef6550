//! Modem command table (spec.md section 4.4): per-command encoders and
//! the command-specific expected response length, kept as a static match
//! rather than a trait-object table (spec.md section 9: "no trait
//! objects, no heap").

/// SIM900/BodyTrace command opcodes (spec.md section 4.4 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModemCommand {
    Ping = 0x00,
    ModemStatus = 0x02,
    MessageStatus = 0x03,
    SendTest = 0x20,
    SendData = 0x40,
    SendDebugData = 0x50,
    GetIncomingPartial = 0x42,
    DeleteIncoming = 0x43,
    PowerOff = 0xE0,
}

impl ModemCommand {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// True if the modem does not send a response at all (spec.md:
    /// send-debug-data "used when modem is off, purely diagnostic").
    pub const fn expects_response(self) -> bool {
        !matches!(self, ModemCommand::SendDebugData)
    }

    /// Expected total response length, including the 1-byte start/cmd/
    /// end and 2-byte CRC framing. `requested_size` is only consulted for
    /// `GetIncomingPartial`, whose response length depends on the number
    /// of payload bytes requested.
    pub fn expected_response_len(self, requested_size: usize) -> Option<usize> {
        match self {
            ModemCommand::Ping => Some(5),
            ModemCommand::ModemStatus => Some(15),
            ModemCommand::MessageStatus => Some(23),
            ModemCommand::SendTest => Some(5),
            ModemCommand::SendData => Some(5),
            ModemCommand::SendDebugData => None,
            ModemCommand::GetIncomingPartial => Some(13 + requested_size),
            ModemCommand::DeleteIncoming => Some(5),
            ModemCommand::PowerOff => Some(5),
        }
    }

    /// Builds the command-specific tx header (everything between the
    /// start byte and the payload, i.e. cmd plus any command arguments).
    /// Header lengths match spec.md's table: ping/modem-status/message-
    /// status/delete-incoming/power-off are 1 byte (cmd only); send-test/
    /// send-data/send-debug-data are 5 bytes (cmd + u32 size);
    /// get-incoming-partial is 9 bytes (cmd + u32 offset + u32 size).
    pub fn build_header(self, buf: &mut heapless::Vec<u8, 9>, size_or_offset: u32, size: u32) {
        buf.clear();
        buf.push(self.code()).ok();
        match self {
            ModemCommand::SendTest | ModemCommand::SendData | ModemCommand::SendDebugData => {
                buf.extend_from_slice(&size_or_offset.to_be_bytes()).ok();
            }
            ModemCommand::GetIncomingPartial => {
                buf.extend_from_slice(&size_or_offset.to_be_bytes()).ok();
                buf.extend_from_slice(&size.to_be_bytes()).ok();
            }
            _ => {}
        }
    }

    /// Builds the `header_extra` bytes [`crate::modem::ModemSession::send_batch`]
    /// expects: the same layout as [`Self::build_header`] with the leading
    /// cmd byte stripped off (the framer pushes the cmd byte itself).
    pub fn header_extra(self, size_or_offset: u32, size: u32) -> heapless::Vec<u8, 8> {
        let mut full = heapless::Vec::<u8, 9>::new();
        self.build_header(&mut full, size_or_offset, size);
        let mut extra = heapless::Vec::new();
        extra.extend_from_slice(&full[1..]).ok();
        extra
    }
}

/// Network state byte parsed from the modem-status response body
/// (`original_source/.../modemMsg.h`'s `modem_state_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModemNetworkState {
    Initializing = 0x00,
    Idle = 0x01,
    Registering = 0x02,
    Connecting = 0x03,
    Connected = 0x04,
    Xfer = 0x05,
    Disconnecting = 0x06,
    Deregistering = 0x07,
    Provisioning = 0x20,
    ErrorInternal = 0x80,
    ErrorBattery = 0x81,
    ErrorSim = 0x82,
    ErrorRegister = 0x83,
    ErrorConnect = 0x84,
    ErrorXfer = 0x85,
    Unknown = 0xFF,
}

impl ModemNetworkState {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Initializing,
            0x01 => Self::Idle,
            0x02 => Self::Registering,
            0x03 => Self::Connecting,
            0x04 => Self::Connected,
            0x05 => Self::Xfer,
            0x06 => Self::Disconnecting,
            0x07 => Self::Deregistering,
            0x20 => Self::Provisioning,
            0x80 => Self::ErrorInternal,
            0x81 => Self::ErrorBattery,
            0x82 => Self::ErrorSim,
            0x83 => Self::ErrorRegister,
            0x84 => Self::ErrorConnect,
            0x85 => Self::ErrorXfer,
            _ => Self::Unknown,
        }
    }

    /// `CONNECTED`, `XFER`, `DISCONNECTING` count as link-up (spec.md
    /// section 4.5).
    pub fn is_link_up(self) -> bool {
        matches!(self, Self::Connected | Self::Xfer | Self::Disconnecting)
    }

    /// Any `0x80..=0xFF`-range state is a link-up error.
    pub fn is_link_up_error(self) -> bool {
        (self as u8) >= 0x80
    }
}

/// Parsed body of the modem-status response (10 bytes after the echoed
/// cmd byte): state, voltage(mV), adc(mV), rssi, signal%, provisioned,
/// temperature(C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemStatus {
    pub state: ModemNetworkState,
    pub voltage_mv: u16,
    pub adc_mv: u16,
    pub rssi: u8,
    pub signal_strength_pct: u8,
    pub provisioned: bool,
    pub temperature_c: i8,
}

impl ModemStatus {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 10 {
            return None;
        }
        Some(Self {
            state: ModemNetworkState::from_byte(body[0]),
            voltage_mv: u16::from_be_bytes([body[1], body[2]]),
            adc_mv: u16::from_be_bytes([body[3], body[4]]),
            rssi: body[5],
            signal_strength_pct: body[6],
            provisioned: body[7] != 0,
            temperature_c: body[8] as i8,
        })
    }
}

/// One `{count, size}` element of the message-status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageStatusElement {
    pub count: u16,
    pub total_size: u32,
}

/// Parsed body of the message-status response (18 bytes: three 6-byte
/// elements — incoming, test, data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageStatus {
    pub incoming: MessageStatusElement,
    pub test: MessageStatusElement,
    pub data: MessageStatusElement,
}

impl MessageStatus {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 18 {
            return None;
        }
        let elem = |offset: usize| MessageStatusElement {
            count: u16::from_be_bytes([body[offset], body[offset + 1]]),
            total_size: u32::from_be_bytes([
                body[offset + 2],
                body[offset + 3],
                body[offset + 4],
                body[offset + 5],
            ]),
        };
        Some(Self {
            incoming: elem(0),
            test: elem(6),
            data: elem(12),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_response_lengths_match_spec_table() {
        assert_eq!(ModemCommand::Ping.expected_response_len(0), Some(5));
        assert_eq!(ModemCommand::ModemStatus.expected_response_len(0), Some(15));
        assert_eq!(ModemCommand::MessageStatus.expected_response_len(0), Some(23));
        assert_eq!(
            ModemCommand::GetIncomingPartial.expected_response_len(100),
            Some(113)
        );
        assert_eq!(ModemCommand::SendDebugData.expected_response_len(0), None);
        assert!(!ModemCommand::SendDebugData.expects_response());
    }

    #[test]
    fn header_lengths_match_spec_table() {
        let mut buf = heapless::Vec::new();
        ModemCommand::Ping.build_header(&mut buf, 0, 0);
        assert_eq!(buf.len(), 1);

        ModemCommand::SendData.build_header(&mut buf, 1024, 0);
        assert_eq!(buf.len(), 5);

        ModemCommand::GetIncomingPartial.build_header(&mut buf, 0, 512);
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn link_up_states_match_spec() {
        assert!(ModemNetworkState::Connected.is_link_up());
        assert!(ModemNetworkState::Xfer.is_link_up());
        assert!(ModemNetworkState::Disconnecting.is_link_up());
        assert!(!ModemNetworkState::Idle.is_link_up());
        assert!(ModemNetworkState::ErrorConnect.is_link_up_error());
        assert!(!ModemNetworkState::Idle.is_link_up_error());
    }

    #[test]
    fn parses_modem_status_body() {
        let body = [0x04, 0x0F, 0xA0, 0x00, 0x00, 0x14, 0x55, 0x01, 0x19, 0x00];
        let status = ModemStatus::parse(&body).unwrap();
        assert_eq!(status.state, ModemNetworkState::Connected);
        assert_eq!(status.voltage_mv, 0x0FA0);
        assert_eq!(status.rssi, 0x14);
        assert!(status.provisioned);
        assert_eq!(status.temperature_c, 0x19);
    }

    #[test]
    fn parses_message_status_body() {
        let mut body = [0u8; 18];
        body[0..2].copy_from_slice(&3u16.to_be_bytes());
        body[2..6].copy_from_slice(&900u32.to_be_bytes());
        let status = MessageStatus::parse(&body).unwrap();
        assert_eq!(status.incoming.count, 3);
        assert_eq!(status.incoming.total_size, 900);
    }
}
