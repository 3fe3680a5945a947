//! Runloop scheduling.
//!
//! Two independent tracks (twin, msg) tick once per second. Every scheduled
//! property carries its own countdown timer, mock sensor state and, in plan
//! mode, the scripted value to send.

use serde_json::{Map, Value};

use crate::config::SimulationConfig;
use crate::index::ResolverIndex;
use crate::model::{format_value, Comm, Device, Property, Runloop, RunloopUnit};
use crate::resolver::ValueResolver;
use crate::sensor::{SensorAction, SensorState};
use crate::stats::Channel;

/// Tick length of both tracks.
pub const TICK_MS: i64 = 1000;

/// Countdown of one scheduled property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownTimer {
    pub time_remain: i64,
    pub original: i64,
}

impl CountdownTimer {
    pub fn new(ms: i64) -> Self {
        Self {
            time_remain: ms,
            original: ms,
        }
    }
}

/// Result of one countdown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    pub fire: bool,
    pub time_remain: i64,
}

/// Advance a countdown by one tick.
///
/// A timer that is not yet due moves 1000ms closer and only fires when the
/// property is in the startup list. A due timer fires and restarts at
/// `reset_to`. Negative timers are parked and never fire.
pub fn process_countdown(time_remain: i64, reset_to: i64, startup: bool) -> Countdown {
    let mut remain = time_remain;
    if remain < 0 {
        return Countdown {
            fire: startup,
            time_remain: remain,
        };
    }

    if remain != 0 {
        remain -= TICK_MS;
        if startup {
            return Countdown {
                fire: true,
                time_remain: remain,
            };
        }
    }

    if remain <= 0 {
        return Countdown {
            fire: true,
            time_remain: reset_to,
        };
    }

    Countdown {
        fire: false,
        time_remain: remain,
    }
}

/// One property on a runloop track.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledProperty {
    pub property_id: String,
    pub comm_index: usize,
    pub timer: CountdownTimer,
    pub sensor: Option<SensorState>,
    /// Scripted value, plan mode only.
    pub plan_value: Option<Value>,
}

/// A function sensor call requested by a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub property_id: String,
    pub url: String,
    pub value: f64,
}

/// Output of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutput {
    /// Property id to raw value: the fired properties merged with the drained additions.
    pub payload: Map<String, Value>,
    pub function_calls: Vec<FunctionCall>,
}

/// Properties, startup list and out-of-band additions of one channel.
#[derive(Debug, Clone, Default)]
pub struct RunloopTrack {
    entries: Vec<ScheduledProperty>,
    /// Ids that fire on the next tick regardless of their countdown.
    startup: Vec<String>,
    /// Startup ids re-armed on every connect.
    startup_cache: Vec<String>,
    additions: Map<String, Value>,
}

impl RunloopTrack {
    pub fn entries(&self) -> &[ScheduledProperty] {
        &self.entries
    }

    pub fn startup(&self) -> &[String] {
        &self.startup
    }

    pub fn additions(&self) -> &Map<String, Value> {
        &self.additions
    }

    fn add_startup(&mut self, id: &str, arm_now: bool) {
        if !self.startup_cache.iter().any(|s| s == id) {
            self.startup_cache.push(id.to_string());
        }
        if arm_now && !self.startup.iter().any(|s| s == id) {
            self.startup.push(id.to_string());
        }
    }

    /// Cycle length of a looping plan: the latest scripted time plus one tick.
    fn plan_cycle(&self) -> i64 {
        self.entries
            .iter()
            .map(|e| e.timer.original)
            .max()
            .unwrap_or(0)
            + TICK_MS
    }
}

/// The two runloop tracks of a device.
#[derive(Debug, Clone, Default)]
pub struct RunloopScheduler {
    twin: RunloopTrack,
    msg: RunloopTrack,
    plan_mode: bool,
    plan_loop: bool,
}

impl RunloopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, channel: Channel) -> &RunloopTrack {
        match channel {
            Channel::Twin => &self.twin,
            Channel::Msg => &self.msg,
        }
    }

    fn track_mut(&mut self, channel: Channel) -> &mut RunloopTrack {
        match channel {
            Channel::Twin => &mut self.twin,
            Channel::Msg => &mut self.msg,
        }
    }

    /// Rebuild both tracks from the device definition.
    ///
    /// `index` must already reflect `device.comms`. In interactive mode the
    /// derived runloop period is written back into each property so it stays
    /// stable across reconfigurations.
    pub fn rebuild(
        &mut self,
        device: &mut Device,
        index: &ResolverIndex,
        config: &SimulationConfig,
        resolver: &mut ValueResolver,
        running: bool,
    ) {
        *self = Self {
            plan_mode: device.plan_mode(),
            plan_loop: device.plan.as_ref().map(|p| p.looping).unwrap_or(false),
            ..Self::default()
        };

        if device.plan_mode() {
            self.rebuild_plan(device, index, config);
            return;
        }

        for (i, comm) in device.comms.iter_mut().enumerate() {
            let Comm::Property(property) = comm else {
                continue;
            };
            let Some(runloop) = property.runloop.as_mut() else {
                continue;
            };

            if runloop.on_start_up && !runloop.include {
                let track = self.track_mut(property.sdk);
                track.add_startup(&property.id, !running);
                if !running {
                    track
                        .additions
                        .insert(property.id.clone(), property.formatted_value());
                }
                continue;
            }

            if !runloop.include {
                continue;
            }

            let period = derive_period(runloop, config, resolver) as i64;
            let on_start_up = runloop.on_start_up;
            let sensor = property.mock.as_ref().map(SensorState::new);

            let track = self.track_mut(property.sdk);
            track.entries.push(ScheduledProperty {
                property_id: property.id.clone(),
                comm_index: i,
                timer: CountdownTimer::new(period),
                sensor,
                plan_value: None,
            });
            if on_start_up {
                track.add_startup(&property.id, !running);
            }
        }
    }

    fn rebuild_plan(&mut self, device: &Device, index: &ResolverIndex, config: &SimulationConfig) {
        let Some(plan) = device.plan.as_ref() else {
            return;
        };

        let startup = plan
            .startup
            .iter()
            .map(|s| (&s.property, &s.value, config.plan.start_delay_ms));
        let timeline = plan.timeline.iter().map(|s| {
            let at = (s.time * 1000.0) as i64 + config.plan.timeline_delay_ms;
            (&s.property, &s.value, at)
        });

        for (property_id, value, at) in startup.chain(timeline) {
            let Some((i, property)) = index
                .index_of(property_id)
                .and_then(|i| device.comms.get(i).and_then(Comm::as_property).map(|p| (i, p)))
            else {
                continue;
            };
            self.track_mut(property.sdk).entries.push(ScheduledProperty {
                property_id: property.id.clone(),
                comm_index: i,
                timer: CountdownTimer::new(at),
                sensor: None,
                plan_value: Some(value.clone()),
            });
        }
    }

    /// Re-arm startup lists and queue startup-only values. Called on every connect.
    pub fn arm_startup(&mut self, comms: &[Comm]) {
        self.twin.startup = self.twin.startup_cache.clone();
        self.msg.startup = self.msg.startup_cache.clone();

        for property in comms.iter().filter_map(Comm::as_property) {
            let startup_only = property
                .runloop
                .as_ref()
                .is_some_and(|r| r.on_start_up && !r.include);
            if startup_only {
                self.track_mut(property.sdk)
                    .additions
                    .insert(property.id.clone(), property.formatted_value());
            }
        }
    }

    /// Queue out-of-band values for the next tick of a channel.
    pub fn update(&mut self, channel: Channel, payload: Map<String, Value>) {
        self.track_mut(channel).additions.extend(payload);
    }

    /// Adopt a function sensor reply.
    pub fn set_sensor_value(&mut self, property_id: &str, value: f64) {
        for track in [&mut self.twin, &mut self.msg] {
            for entry in track.entries.iter_mut().filter(|e| e.property_id == property_id) {
                if let Some(sensor) = entry.sensor.as_mut() {
                    sensor.set_current(value);
                }
            }
        }
    }

    /// Earliest scheduled send across both tracks, in ms.
    pub fn first_send_ms(&self) -> Option<i64> {
        self.twin
            .entries
            .iter()
            .chain(self.msg.entries.iter())
            .map(|e| e.timer.time_remain)
            .filter(|ms| *ms >= 0)
            .min()
    }

    /// Run one tick of a channel.
    ///
    /// Fired properties report their current value; additions are merged on
    /// top and drained, and the startup list is cleared, whether or not
    /// anything fired.
    pub fn tick(&mut self, channel: Channel, comms: &[Comm], resolver: &mut ValueResolver) -> TickOutput {
        let plan_mode = self.plan_mode;
        let plan_loop = self.plan_loop;
        let track = self.track_mut(channel);
        let cycle = track.plan_cycle();
        let mut out = TickOutput::default();

        for entry in track.entries.iter_mut() {
            let Some(property) = comms.get(entry.comm_index).and_then(Comm::as_property) else {
                continue;
            };

            let reset_to = if plan_mode {
                if plan_loop {
                    cycle
                } else {
                    -1
                }
            } else {
                period_of(property)
            };
            let startup = track.startup.iter().any(|s| s == &entry.property_id);
            let countdown = process_countdown(entry.timer.time_remain, reset_to, startup);
            entry.timer.time_remain = countdown.time_remain;

            if countdown.fire && (plan_mode || property.enabled) {
                out.payload
                    .insert(entry.property_id.clone(), scheduled_value(property, entry, plan_mode));
            }

            if let (Some(sensor), Some(mock)) = (entry.sensor.as_mut(), property.mock.as_ref()) {
                if let SensorAction::CallFunction { url, value } = sensor.step(mock, countdown.fire, resolver) {
                    out.function_calls.push(FunctionCall {
                        property_id: entry.property_id.clone(),
                        url,
                        value,
                    });
                }
            }
        }

        out.payload.extend(std::mem::take(&mut track.additions));
        track.startup.clear();
        out
    }
}

fn period_of(property: &Property) -> i64 {
    property
        .runloop
        .as_ref()
        .and_then(|r| r.period_ms)
        .unwrap_or(0) as i64
}

fn scheduled_value(property: &Property, entry: &ScheduledProperty, plan_mode: bool) -> Value {
    if plan_mode {
        return format_value(property.string, entry.plan_value.as_ref().unwrap_or(&Value::Null));
    }
    match &entry.sensor {
        Some(sensor) => serde_json::json!(sensor.current()),
        None => property.formatted_value(),
    }
}

/// Period of a runloop in ms, derived once and kept in `period_ms`.
pub fn derive_period(runloop: &mut Runloop, config: &SimulationConfig, resolver: &mut ValueResolver) -> u64 {
    if let Some(ms) = runloop.period_ms.filter(|ms| *ms > 0) {
        return ms;
    }

    let value_max = *runloop.value_max.get_or_insert(runloop.value);
    let count = if runloop.override_period {
        let range = match runloop.unit {
            RunloopUnit::Secs => config.runloop.secs,
            RunloopUnit::Mins => config.runloop.mins,
        };
        resolver.pick_inclusive(range.min, range.max)
    } else {
        resolver.pick_inclusive(runloop.value, value_max.max(runloop.value))
    };

    let ms = count * runloop.unit.millis();
    runloop.period_ms = Some(ms);
    ms
}
