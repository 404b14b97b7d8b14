//! Green energy and schedule arithmetic
//!
//! Pure functions used by the policy context: converting between watts and
//! amps, estimating the charger's own load, deriving the solar budget and
//! deciding whether the scheduled-charging window is open.

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::Serialize;

use crate::config::CoreConfig;
use crate::settings::Settings;

/// Latest summed readings from all energy meters
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReadings {
    pub generation_w: f64,
    pub consumption_w: f64,
    /// Voltage and phase count reported by a meter, if any
    pub voltage: Option<(f64, f64)>,
    /// Epoch seconds of the last successful poll
    pub updated_at: f64,
    /// Epoch seconds of the last failed poll
    pub last_error_at: Option<f64>,
}

/// Power factor for a charger drawing `amps`
///
/// Linear between `realPowerFactorMinAmps` at `minAmpsPerTWC` and
/// `realPowerFactorMaxAmps` at `wiringMaxAmpsAllTWCs`.
pub fn real_power_factor(config: &CoreConfig, amps: f64) -> f64 {
    let low = config.min_amps_per_twc;
    let high = config.wiring_max_amps_all_twcs;
    if high <= low || amps <= low {
        return config.real_power_factor_min_amps;
    }
    if amps >= high {
        return config.real_power_factor_max_amps;
    }
    let ratio = (amps - low) / (high - low);
    config.real_power_factor_min_amps
        + (config.real_power_factor_max_amps - config.real_power_factor_min_amps) * ratio
}

pub fn watts_to_amps(watts: f64, volts: f64, phases: f64) -> f64 {
    let divisor = volts * phases;
    if divisor <= 0.0 {
        return 0.0;
    }
    watts / divisor
}

/// Watts drawn by chargers delivering `amps` in total
pub fn charger_load_watts(config: &CoreConfig, amps: f64, volts: f64, phases: f64) -> f64 {
    amps * volts * phases * real_power_factor(config, amps)
}

/// Watts to subtract from generation before it is offered to cars
pub fn generation_offset(config: &CoreConfig, consumption_w: f64, charger_load_w: f64) -> f64 {
    let mut offset = consumption_w;
    if config.subtract_charger_load {
        offset -= charger_load_w;
    }
    offset.max(0.0)
}

/// Amps the chargers may share from surplus generation
pub fn green_energy_amps(
    config: &CoreConfig,
    generation_w: f64,
    consumption_w: f64,
    charger_amps: f64,
    volts: f64,
    phases: f64,
) -> f64 {
    let load_w = charger_load_watts(config, charger_amps, volts, phases);
    let offset_w = generation_offset(config, consumption_w, load_w);

    let surplus = charger_amps + watts_to_amps(generation_w - consumption_w, volts, phases);
    let cap = watts_to_amps(generation_w - offset_w, volts, phases);
    (surplus.min(cap) + config.green_energy_amps_offset).max(0.0)
}

/// Whether `local` lies in the scheduled-charging window
///
/// A window crossing midnight is owned by the day it starts on, so after
/// midnight yesterday's day bit decides.
pub fn check_scheduled_charging(settings: &Settings, local: &NaiveDateTime) -> bool {
    let start = settings.scheduled_amps_start_hour;
    let end = settings.scheduled_amps_end_hour;
    let days = settings.scheduled_amps_days_bitmap;
    if settings.scheduled_amps_max <= 0.0 || start < 0.0 || end < 0.0 || days == 0 {
        return false;
    }

    let hour = f64::from(local.hour()) + f64::from(local.minute()) / 60.0;
    let today = local.weekday().num_days_from_monday();
    let yesterday = (today + 6) % 7;
    let day_set = |day: u32| days & (1 << day) != 0;

    if start > end {
        (hour >= start && day_set(today)) || (hour < end && day_set(yesterday))
    } else {
        hour >= start && hour < end && day_set(today)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn config() -> CoreConfig {
        CoreConfig {
            wiring_max_amps_all_twcs: 40.0,
            min_amps_per_twc: 12.0,
            ..Default::default()
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        // 2024-01-01 was a Monday
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_power_factor_interpolation() {
        let mut cfg = config();
        cfg.real_power_factor_min_amps = 0.9;
        cfg.real_power_factor_max_amps = 1.0;
        assert_eq!(real_power_factor(&cfg, 6.0), 0.9);
        assert_eq!(real_power_factor(&cfg, 40.0), 1.0);
        assert!((real_power_factor(&cfg, 26.0) - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_watts_amps() {
        assert_eq!(watts_to_amps(2400.0, 240.0, 1.0), 10.0);
        assert_eq!(watts_to_amps(2400.0, 0.0, 1.0), 0.0);
        assert_eq!(charger_load_watts(&config(), 10.0, 240.0, 1.0), 2400.0);
    }

    #[test]
    fn test_green_budget() {
        let cfg = config();
        // 4.8kW of surplus over a house that does not meter the charger
        assert_eq!(green_energy_amps(&cfg, 6000.0, 1200.0, 0.0, 240.0, 1.0), 20.0);
        // Consumption above generation floors at zero
        assert_eq!(green_energy_amps(&cfg, 500.0, 1200.0, 0.0, 240.0, 1.0), 0.0);

        // Meter includes the charger's 2.4kW
        let mut cfg = config();
        cfg.subtract_charger_load = true;
        assert_eq!(green_energy_amps(&cfg, 6000.0, 3600.0, 10.0, 240.0, 1.0), 20.0);

        cfg.green_energy_amps_offset = -2.0;
        assert_eq!(green_energy_amps(&cfg, 6000.0, 3600.0, 10.0, 240.0, 1.0), 18.0);
    }

    #[test]
    fn test_schedule_same_day() {
        let mut s = Settings::default();
        assert!(!check_scheduled_charging(&s, &at(1, 23, 0)));

        s.scheduled_amps_max = 24.0;
        s.scheduled_amps_start_hour = 22.0;
        s.scheduled_amps_end_hour = 23.5;
        s.scheduled_amps_days_bitmap = 0b0000001; // Monday
        assert!(check_scheduled_charging(&s, &at(1, 22, 0)));
        assert!(check_scheduled_charging(&s, &at(1, 23, 15)));
        assert!(!check_scheduled_charging(&s, &at(1, 23, 30)));
        assert!(!check_scheduled_charging(&s, &at(2, 22, 30)));
    }

    #[test]
    fn test_schedule_across_midnight() {
        let mut s = Settings::default();
        s.scheduled_amps_max = 24.0;
        s.scheduled_amps_start_hour = 22.0;
        s.scheduled_amps_end_hour = 6.0;
        s.scheduled_amps_days_bitmap = 0b0000001; // Monday night
        assert!(check_scheduled_charging(&s, &at(1, 23, 0)));
        // Tuesday early morning belongs to Monday's window
        assert!(check_scheduled_charging(&s, &at(2, 5, 59)));
        assert!(!check_scheduled_charging(&s, &at(2, 6, 0)));
        assert!(!check_scheduled_charging(&s, &at(2, 23, 0)));
        // Monday early morning belongs to Sunday, which is not set
        assert!(!check_scheduled_charging(&s, &at(1, 3, 0)));
    }
}
