//! Macro token resolution.
//!
//! Values written as `AUTO_*` tokens are replaced by random values drawn from
//! the configured ranges. Anything that is not a recognised token is returned
//! unchanged.

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};

use crate::config::{GeoArea, RangesSection};

const WORDS: &[&str] = &[
    "amber", "anchor", "apple", "arrow", "autumn", "badge", "basket", "beacon", "birch", "blossom",
    "border", "breeze", "bridge", "bucket", "cabin", "candle", "canyon", "carbon", "castle",
    "cedar", "channel", "circle", "cliff", "cloud", "comet", "copper", "coral", "cotton", "crystal",
    "delta", "desert", "dolphin", "dragon", "dune", "eagle", "echo", "ember", "engine", "falcon",
    "feather", "field", "flame", "forest", "fossil", "garden", "glacier", "granite", "harbor",
    "hazel", "horizon", "island", "ivory", "jasmine", "jungle", "kernel", "lantern", "lemon",
    "maple", "marble", "meadow", "meteor", "mirror", "nebula", "nickel", "oasis", "ocean", "orbit",
    "pebble", "pepper", "pilot", "planet", "prairie", "quartz", "rapid", "raven", "ribbon",
    "river", "rocket", "saddle", "signal", "silver", "spark", "spruce", "summit", "tiger", "timber",
    "tulip", "tunnel", "valley", "velvet", "violet", "walnut", "willow", "winter", "zephyr",
];

const METERS_PER_DEGREE: f64 = 111_320.0;

/// Extra parameters available while resolving a desired-property acknowledgement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredContext {
    /// The desired value that triggered the acknowledgement.
    pub value: Value,
    /// The desired version that triggered the acknowledgement.
    pub version: Option<Value>,
}

/// Resolves `AUTO_*` tokens into concrete values.
#[derive(Debug)]
pub struct ValueResolver {
    ranges: RangesSection,
    geo: GeoArea,
    rng: StdRng,
}

impl ValueResolver {
    pub fn new(ranges: RangesSection, geo: GeoArea) -> Self {
        Self {
            ranges,
            geo,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic resolver for tests and reproducible runs.
    pub fn with_seed(ranges: RangesSection, geo: GeoArea, seed: u64) -> Self {
        Self {
            ranges,
            geo,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Resolve a single value. Only string tokens are ever replaced.
    pub fn resolve_auto(&mut self, value: &Value, ctx: Option<&DesiredContext>) -> Value {
        let Value::String(token) = value else {
            return value.clone();
        };

        match token.as_str() {
            "AUTO_STRING" => Value::String(self.word().to_string()),
            "AUTO_BOOLEAN" => Value::Bool(self.rng.gen_bool(0.5)),
            "AUTO_INTEGER" | "AUTO_LONG" => Value::from(self.integer()),
            "AUTO_DOUBLE" | "AUTO_FLOAT" => json!(self.double()),
            "AUTO_DATE" => Value::String(self.date_time().format("%Y-%m-%d").to_string()),
            "AUTO_DATETIME" => Value::String(self.date_time().to_rfc3339()),
            "AUTO_TIME" | "AUTO_DURATION" => Value::String(self.time()),
            "AUTO_GEOPOINT" => self.geopoint(),
            "AUTO_VECTOR" => self.vector(),
            "AUTO_MAP" => self.map(),
            "DESIRED_VALUE" => match ctx {
                Some(ctx) => ctx.value.clone(),
                None => value.clone(),
            },
            "DESIRED_VERSION" => match ctx {
                Some(ctx) => ctx.version.clone().unwrap_or(Value::Null),
                None => value.clone(),
            },
            other if other.starts_with("AUTO_ENUM") => self.enumeration(other).unwrap_or_else(|| value.clone()),
            _ => value.clone(),
        }
    }

    /// Resolve every leaf of a JSON tree in place.
    pub fn resolve_tree(&mut self, node: &mut Value, ctx: Option<&DesiredContext>) {
        match node {
            Value::Object(map) => {
                for child in map.values_mut() {
                    self.resolve_tree(child, ctx);
                }
            }
            Value::Array(items) => {
                for child in items.iter_mut() {
                    self.resolve_tree(child, ctx);
                }
            }
            leaf => {
                *leaf = self.resolve_auto(leaf, ctx);
            }
        }
    }

    /// Random value in `min..=max`.
    pub fn pick_inclusive(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    /// Random value in `low..high`, used by mock sensors.
    pub fn gen_f64(&mut self, low: f64, high: f64) -> f64 {
        if low >= high {
            return low;
        }
        self.rng.gen_range(low..high)
    }

    fn word(&mut self) -> &'static str {
        WORDS[self.rng.gen_range(0..WORDS.len())]
    }

    fn integer(&mut self) -> i64 {
        let range = self.ranges.integer;
        if range.min >= range.max {
            return range.min;
        }
        self.rng.gen_range(range.min..=range.max)
    }

    fn double(&mut self) -> f64 {
        let range = self.ranges.double;
        if range.min >= range.max {
            return range.min;
        }
        let raw = self.rng.gen_range(range.min..=range.max);
        // two decimals, kept inside the bounds
        ((raw * 100.0).round() / 100.0).clamp(range.min, range.max)
    }

    fn date_time(&mut self) -> chrono::DateTime<Utc> {
        let offset = self.rng.gen_range(-365 * 86_400..=365 * 86_400);
        Utc::now() + Duration::seconds(offset)
    }

    fn time(&mut self) -> String {
        let secs = self.rng.gen_range(0..86_400u32);
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }

    fn geopoint(&mut self) -> Value {
        let distance = self.geo.radius.max(0.0) * self.rng.gen::<f64>().sqrt();
        let bearing = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let lat = self.geo.latitude + distance * bearing.cos() / METERS_PER_DEGREE;
        let lon_scale = (METERS_PER_DEGREE * self.geo.latitude.to_radians().cos()).max(1.0);
        let lon = self.geo.longitude + distance * bearing.sin() / lon_scale;
        json!({ "lat": lat, "lon": lon, "alt": self.geo.altitude })
    }

    fn vector(&mut self) -> Value {
        let range = self.ranges.vector;
        let mut axis = || {
            if range.min >= range.max {
                range.min
            } else {
                self.rng.gen_range(range.min..=range.max)
            }
        };
        json!({ "x": axis(), "y": axis(), "z": axis() })
    }

    fn map(&mut self) -> Value {
        let mut map = Map::new();
        for _ in 0..self.rng.gen_range(1..=3) {
            let key = self.word().to_string();
            map.insert(key, Value::from(self.integer()));
        }
        Value::Object(map)
    }

    fn enumeration(&mut self, token: &str) -> Option<Value> {
        let (head, body) = token.split_once('/')?;
        if head != "AUTO_ENUM" {
            return None;
        }
        let Ok(Value::Array(items)) = serde_json::from_str::<Value>(body) else {
            return None;
        };
        if items.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..items.len());
        Some(items[index].clone())
    }
}
