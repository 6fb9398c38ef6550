//! Scheduled-message mux (spec.md section 4.8).
//!
//! Storage-clock gates the daily/activated/monthly/GPS messages to a
//! single fixed time of day; GPS measurement (independent of
//! transmission) gates to an earlier fixed time. The data-message session
//! polls [`Scheduler::get_next_message_to_transmit`] until it returns
//! `None`.

use crate::storage::ScheduleFlags;

/// Payload kind the mux hands to the data-message session. Building the
/// actual wire bytes is the caller's job (spec.md section 4.7 says the
/// session itself owns `SendMsg`); the mux only decides *what* and *when*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledMessage {
    FinalAssembly,
    DailyWaterLogs,
    Activated,
    MonthlyCheckIn,
    GpsLocation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PendingFlags {
    final_assembly: bool,
    daily_water_logs: bool,
    activated: bool,
    monthly_check_in: bool,
    gps_location: bool,
}

pub struct Scheduler {
    pending: PendingFlags,
    fired_today: bool,
    gps_fired_today: bool,
    pub perform_gps_measurement: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            pending: PendingFlags {
                final_assembly: false,
                daily_water_logs: false,
                activated: false,
                monthly_check_in: false,
                gps_location: false,
            },
            fired_today: false,
            gps_fired_today: false,
            perform_gps_measurement: false,
        }
    }

    /// Merges in flags the storage engine raised at midnight rollover
    /// (spec.md section 4.9 step 5/7/8).
    pub fn absorb_storage_schedule(&mut self, schedule: &mut ScheduleFlags) {
        self.pending.final_assembly |= schedule.send_final_assembly;
        self.pending.daily_water_logs |= schedule.send_daily_water_logs;
        self.pending.activated |= schedule.send_activated;
        self.pending.monthly_check_in |= schedule.send_monthly_check_in;
        *schedule = ScheduleFlags::default();
    }

    pub fn set_gps_location_pending(&mut self) {
        self.pending.gps_location = true;
    }

    /// Called every exec tick with the storage-clock hour/minute. Latches
    /// the scheduled sends at `01:05` and the GPS measurement at `00:30`
    /// (spec.md section 4.8), each once per day.
    pub fn exec(&mut self, storage_hour: u8, storage_minute: u8) {
        let at_tx_time =
            storage_hour == crate::config::DAILY_TX_HOUR && storage_minute == crate::config::DAILY_TX_MINUTE;
        let at_gps_time = storage_hour == crate::config::GPS_MEASUREMENT_HOUR
            && storage_minute == crate::config::GPS_MEASUREMENT_MINUTE;

        if at_tx_time {
            if !self.fired_today {
                self.fired_today = true;
            }
        } else {
            self.fired_today = false;
        }

        if at_gps_time {
            if !self.gps_fired_today {
                self.gps_fired_today = true;
                self.perform_gps_measurement = true;
            }
        } else {
            self.gps_fired_today = false;
        }
    }

    /// Polled by the data-message session until it returns `None`. Final
    /// assembly drains first (spec.md section 4.9 step 8: it exists to
    /// recover from a prolonged loss of time sync, so it preempts the
    /// routine sends); the rest follows spec.md section 4.8's listing:
    /// daily logs, activated, monthly check-in, GPS location.
    pub fn get_next_message_to_transmit(&mut self) -> Option<ScheduledMessage> {
        if self.pending.final_assembly {
            self.pending.final_assembly = false;
            return Some(ScheduledMessage::FinalAssembly);
        }
        if self.pending.daily_water_logs {
            self.pending.daily_water_logs = false;
            return Some(ScheduledMessage::DailyWaterLogs);
        }
        if self.pending.activated {
            self.pending.activated = false;
            return Some(ScheduledMessage::Activated);
        }
        if self.pending.monthly_check_in {
            self.pending.monthly_check_in = false;
            return Some(ScheduledMessage::MonthlyCheckIn);
        }
        if self.pending.gps_location {
            self.pending.gps_location = false;
            return Some(ScheduledMessage::GpsLocation);
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        self.pending.final_assembly
            || self.pending.daily_water_logs
            || self.pending.activated
            || self.pending.monthly_check_in
            || self.pending.gps_location
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_tx_time_latches_all_pending_storage_flags() {
        let mut scheduler = Scheduler::new();
        let mut flags = ScheduleFlags {
            send_daily_water_logs: true,
            send_activated: true,
            ..Default::default()
        };
        scheduler.absorb_storage_schedule(&mut flags);
        assert_eq!(flags, ScheduleFlags::default());

        assert_eq!(
            scheduler.get_next_message_to_transmit(),
            Some(ScheduledMessage::DailyWaterLogs)
        );
        assert_eq!(
            scheduler.get_next_message_to_transmit(),
            Some(ScheduledMessage::Activated)
        );
        assert_eq!(scheduler.get_next_message_to_transmit(), None);
    }

    #[test]
    fn gps_measurement_fires_once_at_its_scheduled_time() {
        let mut scheduler = Scheduler::new();
        scheduler.exec(crate::config::GPS_MEASUREMENT_HOUR, crate::config::GPS_MEASUREMENT_MINUTE);
        assert!(scheduler.perform_gps_measurement);
        scheduler.perform_gps_measurement = false;
        scheduler.exec(crate::config::GPS_MEASUREMENT_HOUR, crate::config::GPS_MEASUREMENT_MINUTE);
        assert!(!scheduler.perform_gps_measurement);
    }

    #[test]
    fn final_assembly_preempts_the_routine_sends() {
        let mut scheduler = Scheduler::new();
        let mut flags = ScheduleFlags {
            send_final_assembly: true,
            send_daily_water_logs: true,
            ..Default::default()
        };
        scheduler.absorb_storage_schedule(&mut flags);
        assert_eq!(
            scheduler.get_next_message_to_transmit(),
            Some(ScheduledMessage::FinalAssembly)
        );
        assert_eq!(
            scheduler.get_next_message_to_transmit(),
            Some(ScheduledMessage::DailyWaterLogs)
        );
        assert_eq!(scheduler.get_next_message_to_transmit(), None);
    }

    #[test]
    fn mux_drains_in_documented_order() {
        let mut scheduler = Scheduler::new();
        scheduler.set_gps_location_pending();
        let mut flags = ScheduleFlags {
            send_monthly_check_in: true,
            ..Default::default()
        };
        scheduler.absorb_storage_schedule(&mut flags);
        assert_eq!(
            scheduler.get_next_message_to_transmit(),
            Some(ScheduledMessage::MonthlyCheckIn)
        );
        assert_eq!(
            scheduler.get_next_message_to_transmit(),
            Some(ScheduledMessage::GpsLocation)
        );
    }
}
