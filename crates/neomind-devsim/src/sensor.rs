//! Mock sensor state.

use crate::model::{Mock, MockKind};
use crate::resolver::ValueResolver;

/// Linear ramp applied while a sensor warms up.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    slice: f64,
    remaining_ms: f64,
}

/// Follow-up work a sensor step needs from the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorAction {
    None,
    /// POST the current value to a function endpoint and adopt the reply.
    CallFunction { url: String, value: f64 },
}

/// Evolving value of one mock sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    current: f64,
    ramp: Option<Ramp>,
}

impl SensorState {
    pub fn new(mock: &Mock) -> Self {
        let (start, time_to_running) = match mock.kind {
            MockKind::Function => (mock.init, 1.0),
            _ if mock.running > 0.0 => (mock.running, mock.time_to_running),
            _ => (mock.init, mock.time_to_running),
        };

        let ramp = (time_to_running > 0.0).then(|| Ramp {
            slice: start / (time_to_running / 1000.0),
            remaining_ms: time_to_running,
        });

        Self {
            current: mock.init,
            ramp,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn set_current(&mut self, value: f64) {
        self.current = value;
    }

    /// Advance one second. `fired` says whether the property reported this tick;
    /// step sensors only move when it did.
    pub fn step(&mut self, mock: &Mock, fired: bool, resolver: &mut ValueResolver) -> SensorAction {
        let slice = match self.ramp.as_mut() {
            Some(ramp) => {
                let slice = ramp.slice;
                ramp.remaining_ms -= 1000.0;
                if ramp.remaining_ms <= 0.0 {
                    self.ramp = None;
                }
                slice
            }
            None => self.current,
        };

        match mock.kind {
            MockKind::Fan => {
                let variance = if mock.running != 0.0 {
                    mock.variance / mock.running * 100.0
                } else {
                    mock.variance
                };
                self.current = if resolver.gen_f64(1.0, 10.0) >= 5.0 {
                    mock.running - variance
                } else {
                    mock.running + variance
                };
            }
            MockKind::Hotplate => {
                if self.at_reset(mock) {
                    self.current = mock.init;
                } else {
                    let next = self.current + (slice - slice * mock.variance);
                    self.current = next.min(mock.running);
                }
            }
            MockKind::Battery => {
                if self.at_reset(mock) {
                    self.current = mock.init;
                } else {
                    let next = self.current - (slice + slice * mock.variance);
                    self.current = next.max(mock.running);
                }
            }
            MockKind::Random => {
                let upper = 10f64.powf(mock.variance).floor() + 1.0;
                self.current = resolver.gen_f64(0.0, upper).floor();
            }
            MockKind::Inc | MockKind::Dec if fired => {
                let step = if mock.variance != 0.0 { mock.variance } else { 1.0 };
                if self.at_reset(mock) {
                    self.current = mock.init;
                } else if mock.kind == MockKind::Inc {
                    self.current += step;
                } else {
                    self.current -= step;
                }
            }
            MockKind::Function if fired => {
                if let Some(url) = mock.function.as_ref().filter(|u| !u.is_empty()) {
                    return SensorAction::CallFunction {
                        url: url.clone(),
                        value: self.current,
                    };
                }
            }
            _ => {}
        }

        SensorAction::None
    }

    fn at_reset(&self, mock: &Mock) -> bool {
        mock.reset_value()
            .is_some_and(|reset| (reset - self.current).abs() < f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeoArea, RangesSection};
    use serde_json::json;

    fn resolver() -> ValueResolver {
        ValueResolver::with_seed(RangesSection::default(), GeoArea::default(), 3)
    }

    fn mock(kind: MockKind) -> Mock {
        Mock {
            kind,
            init: 0.0,
            running: 0.0,
            variance: 0.0,
            time_to_running: 0.0,
            reset: None,
            function: None,
        }
    }

    #[test]
    fn test_hotplate_ramps_and_clamps() {
        let mut m = mock(MockKind::Hotplate);
        m.init = 20.0;
        m.running = 80.0;
        m.time_to_running = 4000.0;
        let mut state = SensorState::new(&m);
        let mut r = resolver();
        assert_eq!(state.current(), 20.0);

        // slice = 80 / 4 = 20 per second
        state.step(&m, false, &mut r);
        assert_eq!(state.current(), 40.0);
        for _ in 0..10 {
            state.step(&m, false, &mut r);
        }
        assert_eq!(state.current(), 80.0);
    }

    #[test]
    fn test_battery_drains_to_floor_and_resets() {
        let mut m = mock(MockKind::Battery);
        m.init = 100.0;
        m.running = 10.0;
        m.time_to_running = 10_000.0;
        m.reset = Some(json!("10"));
        let mut state = SensorState::new(&m);
        let mut r = resolver();

        for _ in 0..100 {
            state.step(&m, false, &mut r);
            assert!(state.current() >= 10.0);
        }
        // at the reset value the sensor snaps back to init
        state.set_current(10.0);
        state.step(&m, false, &mut r);
        assert_eq!(state.current(), 100.0);
    }

    #[test]
    fn test_inc_only_moves_when_fired() {
        let mut m = mock(MockKind::Inc);
        m.init = 1.0;
        m.variance = 2.0;
        m.reset = Some(json!(5));
        let mut state = SensorState::new(&m);
        let mut r = resolver();

        state.step(&m, false, &mut r);
        assert_eq!(state.current(), 1.0);
        state.step(&m, true, &mut r);
        assert_eq!(state.current(), 3.0);
        state.step(&m, true, &mut r);
        assert_eq!(state.current(), 5.0);
        state.step(&m, true, &mut r);
        assert_eq!(state.current(), 1.0);
    }

    #[test]
    fn test_dec_default_step() {
        let mut m = mock(MockKind::Dec);
        m.init = 3.0;
        let mut state = SensorState::new(&m);
        let mut r = resolver();
        state.step(&m, true, &mut r);
        assert_eq!(state.current(), 2.0);
    }

    #[test]
    fn test_random_range() {
        let mut m = mock(MockKind::Random);
        m.variance = 2.0;
        let mut state = SensorState::new(&m);
        let mut r = resolver();
        for _ in 0..200 {
            state.step(&m, false, &mut r);
            assert!((0.0..=100.0).contains(&state.current()));
            assert_eq!(state.current().fract(), 0.0);
        }
    }

    #[test]
    fn test_fan_oscillates_around_running() {
        let mut m = mock(MockKind::Fan);
        m.running = 1000.0;
        m.variance = 10.0;
        let mut state = SensorState::new(&m);
        let mut r = resolver();
        for _ in 0..50 {
            state.step(&m, false, &mut r);
            let v = state.current();
            assert!((v - 999.0).abs() < 1e-9 || (v - 1001.0).abs() < 1e-9, "got {}", v);
        }
    }

    #[test]
    fn test_function_requests_call_when_fired() {
        let mut m = mock(MockKind::Function);
        m.init = 7.0;
        m.function = Some("http://localhost:7071/api/sensor".into());
        let mut state = SensorState::new(&m);
        let mut r = resolver();

        assert_eq!(state.step(&m, false, &mut r), SensorAction::None);
        assert_eq!(
            state.step(&m, true, &mut r),
            SensorAction::CallFunction {
                url: "http://localhost:7071/api/sensor".into(),
                value: 7.0
            }
        );
    }
}
