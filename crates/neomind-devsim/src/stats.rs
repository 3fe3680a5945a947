//! Per-device statistics.
//!
//! All mutations go through [`Stats::record`], the only place that derives
//! first/last timestamps and recomputes channel rates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reporting channel of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Twin reported properties.
    Twin,
    /// Telemetry messages.
    #[default]
    Msg,
}

/// Symbolic stat names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    On,
    Off,
    Connects,
    Commands,
    C2d,
    Desired,
    Restart,
    Errors,
    Dps,
    Reconfigures,
    /// A successful send on a channel.
    Sent(Channel),
}

/// First/last/count/rate for one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub count: u64,
    /// Sends per minute. `None` until at least one whole minute has elapsed.
    pub rate: Option<f64>,
}

impl ChannelStats {
    fn record(&mut self, at: DateTime<Utc>) {
        if self.first.is_none() {
            self.first = Some(at);
        }
        self.last = Some(at);
        self.count += 1;

        if let (Some(first), Some(last)) = (self.first, self.last) {
            let elapsed_ms = (last - first).num_milliseconds() as f64;
            let minutes = (elapsed_ms / 60_000.0).round();
            self.rate = if minutes >= 1.0 {
                Some(((self.count as f64 / minutes) * 100.0).round() / 100.0)
            } else {
                None
            };
        }
    }
}

/// Counter table for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Stats {
    pub on: u64,
    pub off: u64,
    pub msg: ChannelStats,
    pub twin: ChannelStats,
    pub connects: u64,
    pub commands: u64,
    pub c2d: u64,
    pub desired: u64,
    pub restart: u64,
    pub errors: u64,
    /// Starts at -1 so the initial configuration reads 0.
    pub reconfigures: i64,
    pub dps: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            on: 0,
            off: 0,
            msg: ChannelStats::default(),
            twin: ChannelStats::default(),
            connects: 0,
            commands: 0,
            c2d: 0,
            desired: 0,
            restart: 0,
            errors: 0,
            reconfigures: -1,
            dps: 0,
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event now.
    pub fn record(&mut self, kind: StatKind) {
        self.record_at(kind, Utc::now());
    }

    /// Record one event at a given instant.
    pub fn record_at(&mut self, kind: StatKind, at: DateTime<Utc>) {
        match kind {
            StatKind::On => self.on += 1,
            StatKind::Off => self.off += 1,
            StatKind::Connects => self.connects += 1,
            StatKind::Commands => self.commands += 1,
            StatKind::C2d => self.c2d += 1,
            StatKind::Desired => self.desired += 1,
            StatKind::Restart => self.restart += 1,
            StatKind::Errors => self.errors += 1,
            StatKind::Dps => self.dps += 1,
            StatKind::Reconfigures => self.reconfigures += 1,
            StatKind::Sent(Channel::Msg) => self.msg.record(at),
            StatKind::Sent(Channel::Twin) => self.twin.record(at),
        }
    }
}
