//! Trading hours per asset class.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::models::AssetClass;

/// Daily session in UTC, Monday to Friday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl TradingWindow {
    fn contains(&self, now: DateTime<Utc>) -> bool {
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let time = now.time();
        time >= self.open && time < self.close
    }
}

/// Which asset classes trade when. A class without a window trades around the clock.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    windows: HashMap<AssetClass, TradingWindow>,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        let exchange = TradingWindow {
            open: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
        };

        Self {
            windows: HashMap::from([
                (AssetClass::Equity, exchange),
                (AssetClass::Fund, exchange),
                (AssetClass::Derivative, exchange),
            ]),
        }
    }
}

impl MarketCalendar {
    pub fn is_open(&self, asset_class: AssetClass, now: DateTime<Utc>) -> bool {
        match self.windows.get(&asset_class) {
            Some(window) => window.contains(now),
            None => true,
        }
    }

    /// `now` if the class is open, otherwise the start of its next session.
    pub fn next_open(&self, asset_class: AssetClass, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(window) = self.windows.get(&asset_class) else {
            return now;
        };
        if window.contains(now) {
            return now;
        }

        (0..=7u64)
            .filter_map(|offset| now.date_naive().checked_add_days(Days::new(offset)))
            .filter(|date| !matches!(date.weekday(), Weekday::Sat | Weekday::Sun))
            .map(|date| date.and_time(window.open).and_utc())
            .find(|open| *open > now)
            .unwrap_or(now)
    }

    pub fn any_open(&self, classes: &[AssetClass], now: DateTime<Utc>) -> bool {
        classes.iter().any(|c| self.is_open(*c, now))
    }

    /// Earliest next open across `classes`.
    pub fn next_open_any(&self, classes: &[AssetClass], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        classes.iter().map(|c| self.next_open(*c, now)).min()
    }
}
