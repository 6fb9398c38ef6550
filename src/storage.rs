//! Storage engine (spec.md section 4.9): hourly/daily roll-up into a
//! 5-weekly-log flash ring, ready/transmitted bookkeeping, activation, and
//! red-flag (abnormal-usage) detection.

use crate::error::FaultKind;
use crate::flash::Flash;

pub const DAILY_PACKET_LEN: usize = 128;
pub const DAILY_HEADER_LEN: usize = 16;
pub const DAILY_DATA_LEN: usize = 112;
pub const HOURS_PER_DAY: usize = 24;
pub const PAD_COUNT: usize = 6;

const ERASED_U16: u16 = 0xFFFF;
const SATURATED_U16: u16 = 0xFFFE;

/// One day's rolled-up data (spec.md section 3 "Daily log packet"). The
/// 16-byte message header that prefixes this on the wire is built by the
/// scheduled-message mux, not stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyLog {
    /// milliliters/32 per hour; `0xFFFF` means "no data" (erased, never
    /// written this boot), `0xFFFE` is the saturated maximum.
    pub liters_per_hour: [u16; HOURS_PER_DAY],
    pub total_liters: u16,
    pub avg_28day_daily_liters: u16,
    pub red_flag: bool,
    pub error_bits: u16,
    pub pad_submerged_samples: [u16; PAD_COUNT],
}

impl DailyLog {
    pub const fn erased() -> Self {
        Self {
            liters_per_hour: [ERASED_U16; HOURS_PER_DAY],
            total_liters: 0xFFFF,
            avg_28day_daily_liters: 0xFFFF,
            red_flag: false,
            error_bits: 0xFFFF,
            pad_submerged_samples: [0xFFFF; PAD_COUNT],
        }
    }

    pub fn to_bytes(&self) -> [u8; DAILY_DATA_LEN] {
        let mut out = [0u8; DAILY_DATA_LEN];
        let mut pos = 0;
        for hour in &self.liters_per_hour {
            out[pos..pos + 2].copy_from_slice(&hour.to_be_bytes());
            pos += 2;
        }
        out[pos..pos + 2].copy_from_slice(&self.total_liters.to_be_bytes());
        pos += 2;
        out[pos..pos + 2].copy_from_slice(&self.avg_28day_daily_liters.to_be_bytes());
        pos += 2;
        out[pos] = self.red_flag as u8;
        pos += 1;
        out[pos] = 0; // reserved
        pos += 1;
        out[pos..pos + 2].copy_from_slice(&self.error_bits.to_be_bytes());
        pos += 2;
        for sample in &self.pad_submerged_samples {
            out[pos..pos + 2].copy_from_slice(&sample.to_be_bytes());
            pos += 2;
        }
        // Remaining bytes are reserved and stay zero (erased flash reads
        // as 0xFF there instead, which from_bytes tolerates).
        out
    }

    pub fn from_bytes(bytes: &[u8; DAILY_DATA_LEN]) -> Self {
        let mut liters_per_hour = [0u16; HOURS_PER_DAY];
        let mut pos = 0;
        for hour in &mut liters_per_hour {
            *hour = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
            pos += 2;
        }
        let total_liters = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
        pos += 2;
        let avg_28day_daily_liters = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
        pos += 2;
        let red_flag = bytes[pos] != 0;
        pos += 2; // skip reserved
        let error_bits = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
        pos += 2;
        let mut pad_submerged_samples = [0u16; PAD_COUNT];
        for sample in &mut pad_submerged_samples {
            *sample = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
            pos += 2;
        }
        Self {
            liters_per_hour,
            total_liters,
            avg_28day_daily_liters,
            red_flag,
            error_bits,
            pad_submerged_samples,
        }
    }
}

/// Flash layout offsets within one weekly log (spec.md section 3): 7 daily
/// packets, then a clear-on-transmit bitfield, then a clear-on-ready
/// bitfield.
const CLEAR_ON_TRANSMIT_OFFSET: u32 = (crate::config::DAYS_PER_WEEK * DAILY_PACKET_LEN) as u32;
const CLEAR_ON_READY_OFFSET: u32 = CLEAR_ON_TRANSMIT_OFFSET + crate::config::DAYS_PER_WEEK as u32;
const WEEKLY_LOG_SPAN: u32 = 1024;

pub const WEEKLY_LOG_BASE: u32 = 0x2000;

fn weekly_log_addr(week: u8) -> u32 {
    WEEKLY_LOG_BASE + week as u32 * WEEKLY_LOG_SPAN
}

/// Flash-backed access to the 5-weekly-log ring.
pub struct WeeklyLogStore<F: Flash> {
    flash: F,
}

impl<F: Flash> WeeklyLogStore<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    pub fn erase_week(&mut self, week: u8) -> Result<(), FaultKind> {
        let base = weekly_log_addr(week);
        self.flash.erase_segment(base)?;
        self.flash.erase_segment(base + crate::flash::SEGMENT_SIZE as u32)
    }

    pub fn write_daily_packet(&mut self, week: u8, day_of_week: u8, log: &DailyLog) -> Result<(), FaultKind> {
        let addr = weekly_log_addr(week) + day_of_week as u32 * DAILY_PACKET_LEN as u32;
        self.flash.write_bytes(addr, &log.to_bytes())
    }

    pub fn read_daily_packet(&self, week: u8, day_of_week: u8) -> DailyLog {
        let addr = weekly_log_addr(week) + day_of_week as u32 * DAILY_PACKET_LEN as u32;
        let mut buf = [0u8; DAILY_DATA_LEN];
        self.flash.read(addr, &mut buf);
        DailyLog::from_bytes(&buf)
    }

    fn bitfield_byte(&self, week: u8, offset: u32, day_of_week: u8) -> u8 {
        let addr = weekly_log_addr(week) + offset + day_of_week as u32;
        let mut b = [0u8; 1];
        self.flash.read(addr, &mut b);
        b[0]
    }

    pub fn is_ready(&self, week: u8, day_of_week: u8) -> bool {
        self.bitfield_byte(week, CLEAR_ON_READY_OFFSET, day_of_week) == 0
    }

    pub fn mark_ready(&mut self, week: u8, day_of_week: u8) -> Result<(), FaultKind> {
        let addr = weekly_log_addr(week) + CLEAR_ON_READY_OFFSET + day_of_week as u32;
        self.flash.write_bytes(addr, &[0])
    }

    pub fn is_transmitted(&self, week: u8, day_of_week: u8) -> bool {
        self.bitfield_byte(week, CLEAR_ON_TRANSMIT_OFFSET, day_of_week) == 0
    }

    pub fn mark_transmitted(&mut self, week: u8, day_of_week: u8) -> Result<(), FaultKind> {
        let addr = weekly_log_addr(week) + CLEAR_ON_TRANSMIT_OFFSET + day_of_week as u32;
        self.flash.write_bytes(addr, &[0])
    }
}

/// Red-flag (abnormal usage) detector (spec.md section 4.9 "Red-flag
/// mapping"). Spends its first 28 days after a reset building a per-
/// weekday average, then compares each day's total against that average.
pub struct RedFlagState {
    mapping_days_elapsed: u16,
    thresh_table: [u32; crate::config::DAYS_PER_WEEK],
    active: bool,
}

impl RedFlagState {
    pub const fn new() -> Self {
        Self {
            mapping_days_elapsed: 0,
            thresh_table: [0; crate::config::DAYS_PER_WEEK],
            active: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn average_for(&self, day_of_week: u8) -> u32 {
        self.thresh_table[day_of_week as usize]
    }

    fn is_mapping(&self) -> bool {
        self.mapping_days_elapsed < crate::config::RED_FLAG_TOTAL_MAPPING_DAYS
    }

    /// Called once at midnight rollover with today's finished total.
    /// Returns true iff a *new* red-flag condition fired today.
    pub fn on_daily_total(&mut self, day_of_week: u8, today_liters: u32) -> bool {
        let idx = day_of_week as usize;

        if self.is_mapping() {
            self.thresh_table[idx] += today_liters;
            self.mapping_days_elapsed += 1;
            if self.mapping_days_elapsed >= crate::config::RED_FLAG_TOTAL_MAPPING_DAYS {
                for avg in &mut self.thresh_table {
                    *avg >>= crate::config::RED_FLAG_MAPPING_WEEKS_SHIFT;
                }
            }
            return false;
        }

        let avg = self.thresh_table[idx];
        let mut new_flag = false;

        #[cfg(feature = "red_flag_zero_policy")]
        let should_raise = today_liters == 0 && avg != 0;
        #[cfg(not(feature = "red_flag_zero_policy"))]
        let should_raise = avg > crate::config::MIN_DAILY_LITERS_TO_SET_REDFLAG_CONDITION
            && today_liters * 4 < avg;

        if !self.active && should_raise {
            self.active = true;
            new_flag = true;
        } else if self.active && today_liters * 4 > avg * 3 {
            self.active = false;
        }

        if !self.active && !new_flag {
            // EWMA toward today with weight 1/4, matching appRecord-style
            // fixed-point arithmetic elsewhere in this crate.
            self.thresh_table[idx] = (3 * avg + today_liters) / 4;
        }

        new_flag
    }
}

impl Default for RedFlagState {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling flags the storage engine raises for the scheduled-message
/// mux (spec.md section 4.8) to consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleFlags {
    pub send_daily_water_logs: bool,
    pub send_activated: bool,
    pub send_final_assembly: bool,
    pub send_monthly_check_in: bool,
}

/// Top-level storage engine state (spec.md section 4.9). Owns the weekly
/// log ring and red-flag detector; the caller supplies the current
/// wall-clock hour each exec tick so rollovers can be detected.
pub struct StorageEngine<F: Flash> {
    logs: WeeklyLogStore<F>,
    red_flag: RedFlagState,

    hour_accum_ml: u32,
    day_accum_ml: u32,
    hour_last_seen: Option<u8>,

    current_week: u8,
    day_of_week: u8,
    today: DailyLog,

    activated: bool,
    days_activated: u16,
    transmission_rate_days: u8,
    days_since_last_tx: u32,
    days_since_time_sync: u32,

    pub schedule: ScheduleFlags,
}

impl<F: Flash> StorageEngine<F> {
    pub fn new(flash: F) -> Self {
        Self {
            logs: WeeklyLogStore::new(flash),
            red_flag: RedFlagState::new(),
            hour_accum_ml: 0,
            day_accum_ml: 0,
            hour_last_seen: None,
            current_week: 0,
            day_of_week: 0,
            today: DailyLog::erased(),
            activated: false,
            days_activated: 0,
            transmission_rate_days: crate::config::TRANSMISSION_RATE_MAX_DAYS,
            days_since_last_tx: 0,
            days_since_time_sync: 0,
            schedule: ScheduleFlags::default(),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn days_activated(&self) -> u16 {
        self.days_activated
    }

    pub fn current_week(&self) -> u8 {
        self.current_week
    }

    pub fn day_of_week(&self) -> u8 {
        self.day_of_week
    }

    /// Clamped to `[1, 28]` (spec.md section 4.9 "Transmission rate
    /// setting").
    pub fn set_transmission_rate_days(&mut self, days: u8) {
        self.transmission_rate_days = days.clamp(
            crate::config::TRANSMISSION_RATE_MIN_DAYS,
            crate::config::TRANSMISSION_RATE_MAX_DAYS,
        );
    }

    pub fn force_activate(&mut self) {
        if self.days_activated == 0 {
            self.days_activated = 1;
        }
        self.activated = true;
    }

    pub fn silence(&mut self) {
        self.days_activated = 0;
        self.activated = false;
    }

    pub fn reset_red_flag(&mut self) {
        self.red_flag.reset();
    }

    pub fn reset_data(&mut self) -> Result<(), FaultKind> {
        self.silence();
        self.red_flag.reset();
        for week in 0..crate::config::NUM_WEEKLY_LOGS as u8 {
            self.logs.erase_week(week)?;
        }
        self.current_week = 0;
        self.day_of_week = 0;
        Ok(())
    }

    pub fn note_time_sync(&mut self) {
        self.days_since_time_sync = 0;
    }

    /// Called continuously (not gated to the exec tick) as the excluded
    /// water-volume algorithm reports new milliliters.
    pub fn add_water_ml(&mut self, ml: u32) {
        self.hour_accum_ml += ml;
    }

    /// Called every exec tick with the current wall-clock hour; detects
    /// the hour and midnight rollovers described in spec.md section 4.9.
    pub fn exec(&mut self, current_hour: u8) -> Result<(), FaultKind> {
        if let Some(prev_hour) = self.hour_last_seen {
            if prev_hour != current_hour {
                self.on_hour_rollover(prev_hour)?;
                if prev_hour == 23 && current_hour == 0 {
                    self.on_midnight_rollover()?;
                }
            }
        }
        self.hour_last_seen = Some(current_hour);
        Ok(())
    }

    fn on_hour_rollover(&mut self, finished_hour: u8) -> Result<(), FaultKind> {
        let quantized = quantize_ml(self.hour_accum_ml);
        if self.activated {
            self.today.liters_per_hour[finished_hour as usize] = quantized;
            self.logs
                .write_daily_packet(self.current_week, self.day_of_week, &self.today)?;
        }
        self.day_accum_ml += self.hour_accum_ml;
        self.hour_accum_ml = 0;
        Ok(())
    }

    fn on_midnight_rollover(&mut self) -> Result<(), FaultKind> {
        for hour in &mut self.today.liters_per_hour {
            if *hour == ERASED_U16 {
                *hour = 0;
            }
        }
        self.today.total_liters = (self.day_accum_ml / 1000).min(0xFFFF as u32) as u16;

        let new_flag = self
            .red_flag
            .on_daily_total(self.day_of_week, self.today.total_liters as u32);
        self.today.red_flag = self.red_flag.is_active();
        self.today.avg_28day_daily_liters = self.red_flag.average_for(self.day_of_week).min(0xFFFF) as u16;
        if new_flag {
            log::warn!(
                "red flag raised on day_of_week={} total_liters={}",
                self.day_of_week,
                self.today.total_liters
            );
        }

        self.logs
            .write_daily_packet(self.current_week, self.day_of_week, &self.today)?;
        self.logs.mark_ready(self.current_week, self.day_of_week)?;

        self.days_since_last_tx += 1;
        if self.days_since_last_tx >= self.transmission_rate_days as u32 || new_flag {
            log::info!(
                "scheduling daily-log transmission: days_since_last_tx={} new_flag={}",
                self.days_since_last_tx,
                new_flag
            );
            self.schedule_transmission()?;
        }

        self.day_of_week += 1;
        if self.day_of_week >= crate::config::DAYS_PER_WEEK as u8 {
            self.day_of_week = 0;
            self.current_week = (self.current_week + 1) % crate::config::NUM_WEEKLY_LOGS as u8;
            log::info!("week rollover: erasing weekly log {}", self.current_week);
            self.logs.erase_week(self.current_week)?;
            if self.current_week % 4 == 0 {
                self.schedule.send_monthly_check_in = true;
            }
        }

        if !self.activated {
            if self.day_accum_ml > crate::config::ACTIVATION_THRESHOLD_ML {
                log::info!("unit activated: day_accum_ml={}", self.day_accum_ml);
                self.activated = true;
                self.schedule.send_activated = true;
            }
        } else {
            self.days_activated = self.days_activated.saturating_add(1);
            self.days_since_time_sync += 1;
            if self.days_since_last_tx >= crate::config::DAYS_WITHOUT_SYNC_FOR_FINAL_ASSEMBLY
                || self.days_since_time_sync >= crate::config::DAYS_WITHOUT_SYNC_FOR_FINAL_ASSEMBLY
            {
                self.schedule.send_final_assembly = true;
            }
        }

        self.day_accum_ml = 0;
        self.today = DailyLog::erased();
        Ok(())
    }

    /// Walks the ring oldest-first starting at `(current_week+1) mod 5`,
    /// marking each ready-and-unsent day transmitted, capped at
    /// `MAX_DAILY_LOGS_PER_TRANSMISSION` to bound worst-case flash writes.
    fn schedule_transmission(&mut self) -> Result<(), FaultKind> {
        self.schedule.send_daily_water_logs = true;
        self.days_since_last_tx = 0;

        let mut marked = 0u16;
        let num_weeks = crate::config::NUM_WEEKLY_LOGS as u8;
        let mut week = (self.current_week + 1) % num_weeks;
        while week != self.current_week && marked < crate::config::MAX_DAILY_LOGS_PER_TRANSMISSION {
            for day in 0..crate::config::DAYS_PER_WEEK as u8 {
                if marked >= crate::config::MAX_DAILY_LOGS_PER_TRANSMISSION {
                    break;
                }
                if self.logs.is_ready(week, day) && !self.logs.is_transmitted(week, day) {
                    self.logs.mark_transmitted(week, day)?;
                    marked += 1;
                }
            }
            week = (week + 1) % num_weeks;
        }
        Ok(())
    }
}

/// milliliters -> milliliters/32, saturating to `0xFFFE` (spec.md section
/// 4.9 step 1).
fn quantize_ml(ml: u32) -> u16 {
    let scaled = ml / 32;
    if scaled >= SATURATED_U16 as u32 {
        SATURATED_U16
    } else {
        scaled as u16
    }
}
