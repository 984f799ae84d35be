// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Defaults suit tests and most programs. `from_env` layers overrides from
//! `STRAND_MAX_POLLS_PER_TURN`, `STRAND_PARK_WHEN_IDLE` and
//! `STRAND_REPORT_UNHANDLED` on top.

use crate::error::Error;

/// Upper bound on coroutine polls in one turn before timers run.
const DEFAULT_MAX_POLLS_PER_TURN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Coroutine polls plus deferred callbacks per turn before due timers
    /// get their chance. Keeps work that keeps requeueing itself from
    /// starving timers.
    pub max_polls_per_turn: usize,
    /// With nothing runnable and no timer pending, park waiting for a
    /// wakeup from another thread instead of reporting a deadlock.
    pub park_when_idle: bool,
    /// Send unhandled future rejections to the rejection hook.
    ///
    /// Reporting is a per-thread switch. Building a scheduler sets it for
    /// the whole thread, so the most recently built scheduler wins.
    pub report_unhandled_rejections: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_polls_per_turn: DEFAULT_MAX_POLLS_PER_TURN,
            park_when_idle: false,
            report_unhandled_rejections: true,
        }
    }
}

impl SchedulerConfig {
    /// Defaults plus environment overrides. Unparsable values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = env_value(&lookup, "STRAND_MAX_POLLS_PER_TURN", |s| s.parse().ok()) {
            config.max_polls_per_turn = n;
        }
        if let Some(park) = env_value(&lookup, "STRAND_PARK_WHEN_IDLE", parse_bool) {
            config.park_when_idle = park;
        }
        if let Some(report) = env_value(&lookup, "STRAND_REPORT_UNHANDLED", parse_bool) {
            config.report_unhandled_rejections = report;
        }
        config
    }

    pub fn with_max_polls_per_turn(mut self, n: usize) -> Self {
        self.max_polls_per_turn = n;
        self
    }

    pub fn with_park_when_idle(mut self, park: bool) -> Self {
        self.park_when_idle = park;
        self
    }

    pub fn with_report_unhandled_rejections(mut self, report: bool) -> Self {
        self.report_unhandled_rejections = report;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_polls_per_turn == 0 {
            return Err(Error::Config(
                "max_polls_per_turn must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_value<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let value = lookup(key)?;
    let parsed = parse(value.trim());
    if parsed.is_none() {
        log::warn!("ignoring {key}={value:?}: not a valid value");
    }
    parsed
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_polls_per_turn, 1024);
        assert!(!config.park_when_idle);
        assert!(config.report_unhandled_rejections);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            ("STRAND_MAX_POLLS_PER_TURN", "16"),
            ("STRAND_PARK_WHEN_IDLE", "yes"),
            ("STRAND_REPORT_UNHANDLED", "0"),
        ]));
        assert_eq!(config.max_polls_per_turn, 16);
        assert!(config.park_when_idle);
        assert!(!config.report_unhandled_rejections);
    }

    #[test]
    fn bad_env_values_keep_defaults() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            ("STRAND_MAX_POLLS_PER_TURN", "lots"),
            ("STRAND_PARK_WHEN_IDLE", "maybe"),
        ]));
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn zero_polls_is_invalid() {
        let config = SchedulerConfig::default().with_max_polls_per_turn(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
