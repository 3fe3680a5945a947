//! Connection lifecycle of one device.
//!
//! `ConnectionManager` only tracks state; the engine performs the network
//! work and reports outcomes back through the transition methods.

use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::resolver::ValueResolver;

/// Lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Provisioning,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// DPS registration progress within one start.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum Registration {
    #[default]
    None,
    InFlight,
    Ready(String),
}

/// Decision of one DPS poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPoll {
    /// A registration produced this connection string; connect with it.
    Connect(String),
    /// All attempts failed.
    Exhausted,
    /// Submit a new registration attempt.
    Attempt { remaining: u32 },
    /// An attempt is still in flight.
    Wait,
}

/// Connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    state: ConnectionState,
    retries_left: u32,
    registration: Registration,
    restart_loop_ms: u64,
    session: u64,
    restarting: bool,
}

impl ConnectionManager {
    pub fn new(restart_loop_ms: u64) -> Self {
        Self {
            state: ConnectionState::Idle,
            retries_left: 0,
            registration: Registration::None,
            restart_loop_ms,
            session: 0,
            restarting: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A start is in progress or the device is connected.
    pub fn is_running(&self) -> bool {
        !matches!(self.state, ConnectionState::Idle | ConnectionState::Stopped)
    }

    /// Forced-reconnect period, fixed for the lifetime of the device.
    pub fn restart_loop_ms(&self) -> u64 {
        self.restart_loop_ms
    }

    /// Current connection session. Outcomes from older sessions are stale.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_current(&self, session: u64) -> bool {
        self.session == session
    }

    /// Set between a forced reconnect and the first desired update after it.
    pub fn is_restarting(&self) -> bool {
        self.restarting
    }

    pub fn clear_restarting(&mut self) {
        self.restarting = false;
    }

    /// Enter provisioning with a fresh retry budget.
    pub fn begin_provisioning(&mut self, retries: u32) -> u64 {
        self.state = ConnectionState::Provisioning;
        self.retries_left = retries;
        self.registration = Registration::None;
        self.new_session()
    }

    /// Decide what the next provisioning poll does.
    pub fn poll_provisioning(&mut self) -> ProvisioningPoll {
        if let Registration::Ready(cs) = &self.registration {
            let cs = cs.clone();
            self.registration = Registration::None;
            self.state = ConnectionState::Connecting;
            return ProvisioningPoll::Connect(cs);
        }
        if self.retries_left == 0 {
            return ProvisioningPoll::Exhausted;
        }
        if self.registration == Registration::InFlight {
            return ProvisioningPoll::Wait;
        }
        self.registration = Registration::InFlight;
        ProvisioningPoll::Attempt {
            remaining: self.retries_left,
        }
    }

    pub fn registration_failed(&mut self) {
        self.registration = Registration::None;
        self.retries_left = self.retries_left.saturating_sub(1);
    }

    pub fn registration_succeeded(&mut self, connection_string: String) {
        self.registration = Registration::Ready(connection_string);
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Enter connecting without provisioning.
    pub fn begin_connecting(&mut self) -> u64 {
        self.state = ConnectionState::Connecting;
        self.new_session()
    }

    pub fn connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Tear down for a forced reconnect; returns the new session.
    pub fn begin_reconnect(&mut self) -> u64 {
        self.state = ConnectionState::Reconnecting;
        self.restarting = true;
        self.new_session()
    }

    /// Terminal for this start. Stale outcomes are invalidated.
    pub fn stopped(&mut self) {
        self.state = ConnectionState::Stopped;
        self.retries_left = 0;
        self.registration = Registration::None;
        self.restarting = false;
        self.new_session();
    }

    fn new_session(&mut self) -> u64 {
        self.session += 1;
        self.session
    }
}

/// Pick the forced-reconnect period in ms from the configured hour window.
pub fn pick_restart_loop_ms(config: &SimulationConfig, resolver: &mut ValueResolver) -> u64 {
    let range = config.simulation.restart;
    resolver.pick_inclusive(range.min, range.max) * 3_600_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeoArea, Range, RangesSection};

    #[test]
    fn test_provisioning_exhausts_after_budget() {
        let mut cm = ConnectionManager::new(3_600_000);
        cm.begin_provisioning(3);
        let mut attempts = 0;
        loop {
            match cm.poll_provisioning() {
                ProvisioningPoll::Attempt { .. } => {
                    attempts += 1;
                    cm.registration_failed();
                }
                ProvisioningPoll::Exhausted => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_in_flight_guard_and_success() {
        let mut cm = ConnectionManager::new(1);
        cm.begin_provisioning(2);
        assert_eq!(cm.poll_provisioning(), ProvisioningPoll::Attempt { remaining: 2 });
        assert_eq!(cm.poll_provisioning(), ProvisioningPoll::Wait);
        cm.registration_succeeded("HostName=h;DeviceId=d".into());
        assert_eq!(
            cm.poll_provisioning(),
            ProvisioningPoll::Connect("HostName=h;DeviceId=d".into())
        );
        assert_eq!(cm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_sessions_invalidate_on_stop() {
        let mut cm = ConnectionManager::new(1);
        let s = cm.begin_connecting();
        assert!(cm.is_current(s));
        assert!(cm.is_running());
        cm.stopped();
        assert!(!cm.is_current(s));
        assert!(!cm.is_running());
    }

    #[test]
    fn test_restart_loop_within_window() {
        let mut config = SimulationConfig::default();
        config.simulation.restart = Range::new(2, 2);
        let mut resolver = ValueResolver::with_seed(RangesSection::default(), GeoArea::default(), 3);
        assert_eq!(pick_restart_loop_ms(&config, &mut resolver), 7_200_000);
    }
}
