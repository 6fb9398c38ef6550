//! Compile-time tunables (spec.md section 6: "No CLI, no env vars, no
//! config files. All configuration is persisted in the App and
//! Manufacturing records; runtime changes arrive via OTA messages.").
//!
//! This plays the role the teacher's `constants.rs` plays: a single place
//! downstream modules pull numeric knobs from, except these are the
//! protocol- and scheduling-level constants named throughout spec.md
//! rather than network buffer sizes.

/// System tick period (spec.md section 2): the RTC timer ISR fires every
/// half second.
pub const TICK_PERIOD_MS: u32 = 500;
/// Exec routines run every 4th tick (spec.md section 2).
pub const EXEC_TICK_DIVISOR: u32 = 4;

/// Modem frame retry/timeout bounds (spec.md section 4.4).
pub const MODEM_CMD_MAX_RETRIES: u8 = 3;
pub const MODEM_FRAME_TIMEOUT_SECS: u32 = 5;

/// Data-message session bounds (spec.md section 4.7/7).
pub const MAX_MODEM_POWER_CYCLES: u8 = 1;
pub const LINK_UP_TIMEOUT_SECS: u32 = 10 * 60;
pub const CONNECT_TIMEOUT_RETRY_SECS: u32 = 12 * 60 * 60;

/// OTA dispatcher bounds (spec.md section 4.10).
pub const MAX_OTA_MESSAGES_PER_SESSION: u16 = 50;
pub const OTA_PHASE1_MAX_PAYLOAD: usize = 512;
pub const OTA_RESPONSE_LEN: usize = 48;
pub const OTA_HEADER_LEN: usize = 16;
pub const OTA_DATA_REGION_LEN: usize = 32;

/// Cloud message header fields (spec.md section 3 "Message header"),
/// shared by every outbound message including the OTA reply.
pub const MSG_HEADER_START_BYTE: u8 = 0x01;
pub const MSG_HEADER_RESERVED: u8 = 0xA5;
pub const MSG_ID_OTA_REPLY: u8 = 0x03;
pub const PRODUCT_ID: u8 = 0x01;
pub const FW_VERSION_MAJOR: u8 = 2;
pub const FW_VERSION_MINOR: u8 = 0;

/// Firmware-upgrade loader bounds (spec.md section 4.11).
pub const FW_UPGRADE_MAX_DURATION_SECS: u32 = 10 * 60;
pub const FW_UPGRADE_MODEM_MAX_RETRIES: u8 = 3;
pub const FW_UPGRADE_REBOOT_COUNTDOWN_SECS: u32 = 20;
pub const FW_UPGRADE_KEY: [u8; 4] = [0x31, 0x41, 0x59, 0x26];
pub const RESET_DEVICE_KEY: [u8; 4] = [0xAA, 0x55, 0xCC, 0x33];

/// Storage engine bounds (spec.md section 4.9).
pub const RED_FLAG_TOTAL_MAPPING_DAYS: u16 = 28;
pub const RED_FLAG_MAPPING_WEEKS_SHIFT: u32 = 2;
pub const MIN_DAILY_LITERS_TO_SET_REDFLAG_CONDITION: u32 = 200;
pub const ACTIVATION_THRESHOLD_ML: u32 = 50_000;
pub const DAYS_WITHOUT_SYNC_FOR_FINAL_ASSEMBLY: u16 = 28;
pub const MAX_DAILY_LOGS_PER_TRANSMISSION: u16 = 35;
pub const NUM_WEEKLY_LOGS: usize = 5;
pub const DAYS_PER_WEEK: usize = 7;
pub const TRANSMISSION_RATE_MIN_DAYS: u8 = 1;
pub const TRANSMISSION_RATE_MAX_DAYS: u8 = 28;

/// Scheduled-message mux bounds (spec.md section 4.8).
pub const DAILY_TX_HOUR: u8 = 1;
pub const DAILY_TX_MINUTE: u8 = 5;
pub const GPS_MEASUREMENT_HOUR: u8 = 0;
pub const GPS_MEASUREMENT_MINUTE: u8 = 30;

/// System exec startup sequencing (spec.md section 4.12).
pub const MODEM_SEND_TEST_TIMEOUT_SECS: u32 = 5 * 60;
pub const STARTUP_MESSAGE_GAP_SECS: u32 = 10;
