// Copyright (c) 2025 Sunward Contributors
//
// This file is part of Sunward.
//
// Licensed under the MIT License. See <https://opensource.org/licenses/MIT>.
//
// This software is provided "AS IS", without warranty of any kind.

use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use sunward_core::{TariffOracle, TariffRates};
use sunward_types::TariffConfig;

/// Utility tariff computed from the configured plan.
///
/// The plan is a flat import/export pair with a seasonal weekday on-peak
/// window carrying a higher import rate, the shape of a typical
/// residential time-of-use plan.
#[derive(Debug, Clone)]
pub struct TariffSchedule {
    config: TariffConfig,
}

impl TariffSchedule {
    pub fn new(config: TariffConfig) -> Self {
        Self { config }
    }
}

impl TariffOracle for TariffSchedule {
    fn rates_at(&self, at: DateTime<Local>) -> TariffRates {
        let from_grid = if self.is_on_peak(at) {
            self.config.on_peak_import_rate
        } else {
            self.config.import_rate
        };
        TariffRates {
            from_grid,
            to_grid: self.config.export_rate,
        }
    }

    fn is_on_peak(&self, at: DateTime<Local>) -> bool {
        if !self.config.on_peak_months.contains(&at.month()) {
            return false;
        }
        if self.config.on_peak_weekdays_only
            && matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
        {
            return false;
        }
        (self.config.on_peak_start_hour..self.config.on_peak_end_hour).contains(&at.hour())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule() -> TariffSchedule {
        TariffSchedule::new(TariffConfig::default())
    }

    fn local(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
    ) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn test_summer_weekday_evening_is_on_peak() {
        // 2025-07-15 is a Tuesday.
        let at = local(2025, 7, 15, 17);
        assert!(schedule().is_on_peak(at));
        assert_eq!(
            schedule().rates_at(at).from_grid,
            TariffConfig::default().on_peak_import_rate
        );
    }

    #[test]
    fn test_weekend_is_off_peak() {
        // 2025-07-19 is a Saturday.
        let at = local(2025, 7, 19, 17);
        assert!(!schedule().is_on_peak(at));
    }

    #[test]
    fn test_winter_is_off_peak() {
        let at = local(2025, 1, 14, 17);
        assert!(!schedule().is_on_peak(at));
    }

    #[test]
    fn test_window_bounds() {
        let noon = local(2025, 7, 15, 12);
        assert!(!schedule().is_on_peak(noon));
        let end = local(2025, 7, 15, 21);
        assert!(!schedule().is_on_peak(end));
        let last_hour = local(2025, 7, 15, 20);
        assert!(schedule().is_on_peak(last_hour));
    }

    #[test]
    fn test_export_rate_is_flat() {
        let on_peak = local(2025, 7, 15, 17);
        let off_peak = local(2025, 1, 14, 17);
        let schedule = schedule();
        assert_eq!(
            schedule.rates_at(on_peak).to_grid,
            schedule.rates_at(off_peak).to_grid
        );
    }
}
