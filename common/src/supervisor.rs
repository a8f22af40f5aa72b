use log::{info, warn};

use crate::types::LinkState;

pub const STATUS_CHECK_INTERVAL_MS: u64 = 5_000;
pub const RECONNECT_INTERVAL_MS: u64 = 30_000;
pub const RECONNECT_WAIT_MS: u64 = 10_000;
pub const RECONNECT_SETTLE_MS: u64 = 1_000;
pub const WATCHDOG_TIMEOUT_MS: u64 = 900_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub status_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub watchdog_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: STATUS_CHECK_INTERVAL_MS,
            reconnect_interval_ms: RECONNECT_INTERVAL_MS,
            watchdog_timeout_ms: WATCHDOG_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    StartControlServer,
    StopControlServer,
    DropBrokerSession,
    /// Disconnect, settle, reassociate and wait up to [`RECONNECT_WAIT_MS`].
    ReconnectLink,
    /// Terminal: the caller restarts the device.
    Restart { reason: String },
}

/// Link lifecycle plus the inactivity watchdog. Time is passed in by the caller.
#[derive(Debug, Clone)]
pub struct ConnectivitySupervisor {
    config: SupervisorConfig,
    state: LinkState,
    last_status_check_ms: Option<u64>,
    last_reconnect_attempt_ms: Option<u64>,
    last_activity_ms: u64,
    server_requested: bool,
    server_bound: bool,
    watchdog_enabled: bool,
    watchdog_fired: bool,
}

/// `now - since`, or `None` when the counter wrapped below `since`.
fn elapsed_since(now_ms: u64, since_ms: u64) -> Option<u64> {
    now_ms.checked_sub(since_ms)
}

impl ConnectivitySupervisor {
    pub fn new(config: SupervisorConfig, now_ms: u64) -> Self {
        Self {
            config,
            state: LinkState::Disconnected,
            last_status_check_ms: None,
            last_reconnect_attempt_ms: None,
            last_activity_ms: now_ms,
            server_requested: false,
            server_bound: false,
            watchdog_enabled: true,
            watchdog_fired: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// True once the control worker reports its listener bound.
    pub fn server_started(&self) -> bool {
        self.server_bound
    }

    /// Listener state as published by the control worker.
    pub fn observe_server(&mut self, bound: bool) {
        if bound != self.server_bound {
            info!("control server {}", if bound { "bound" } else { "released" });
        }
        self.server_bound = bound;
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.watchdog_enabled
    }

    pub fn set_watchdog_enabled(&mut self, enabled: bool, now_ms: u64) {
        if enabled && !self.watchdog_enabled {
            self.rearm(now_ms);
        }
        self.watchdog_enabled = enabled;
    }

    /// Restarts the inactivity window from `now_ms`.
    pub fn rearm(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
        self.watchdog_fired = false;
    }

    pub fn tick(&mut self, now_ms: u64, link_up: bool) -> Vec<SupervisorAction> {
        let mut actions = Vec::new();

        if let Some(reason) = self.check_watchdog(now_ms, link_up) {
            actions.push(SupervisorAction::Restart { reason });
            return actions;
        }

        let status_due = self
            .last_status_check_ms
            .and_then(|last| elapsed_since(now_ms, last))
            .map_or(true, |elapsed| elapsed >= self.config.status_interval_ms);
        if !status_due {
            return actions;
        }
        self.last_status_check_ms = Some(now_ms);

        if link_up {
            if self.state != LinkState::Connected {
                info!("wifi link up");
            }
            self.state = LinkState::Connected;
            if !self.server_requested {
                self.server_requested = true;
                actions.push(SupervisorAction::StartControlServer);
            }
            return actions;
        }

        if self.state == LinkState::Connected {
            warn!("wifi link lost");
        }
        self.state = LinkState::Disconnected;
        if self.server_requested {
            self.server_requested = false;
            actions.push(SupervisorAction::StopControlServer);
        }
        actions.push(SupervisorAction::DropBrokerSession);

        let reconnect_due = self
            .last_reconnect_attempt_ms
            .and_then(|last| elapsed_since(now_ms, last))
            .map_or(true, |elapsed| elapsed >= self.config.reconnect_interval_ms);
        if reconnect_due {
            self.last_reconnect_attempt_ms = Some(now_ms);
            self.state = LinkState::Connecting;
            actions.push(SupervisorAction::ReconnectLink);
        }

        actions
    }

    /// Outcome of a [`SupervisorAction::ReconnectLink`] the caller performed.
    pub fn reconnect_finished(&mut self, now_ms: u64, link_up: bool) {
        if link_up {
            info!("wifi reconnected");
            self.state = LinkState::Connected;
            self.last_activity_ms = now_ms;
        } else {
            warn!("wifi reconnect attempt failed");
            self.state = LinkState::Disconnected;
        }
    }

    /// Time left before the watchdog fires, `None` while it is disabled.
    pub fn watchdog_remaining_ms(&self, now_ms: u64) -> Option<u64> {
        if !self.watchdog_enabled {
            return None;
        }
        let elapsed = elapsed_since(now_ms, self.last_activity_ms).unwrap_or(0);
        Some(self.config.watchdog_timeout_ms.saturating_sub(elapsed))
    }

    fn check_watchdog(&mut self, now_ms: u64, link_up: bool) -> Option<String> {
        if link_up {
            self.last_activity_ms = now_ms;
            return None;
        }

        let Some(elapsed) = elapsed_since(now_ms, self.last_activity_ms) else {
            warn!("monotonic clock wrapped; rebasing watchdog");
            self.last_activity_ms = now_ms;
            return None;
        };

        if !self.watchdog_enabled || self.watchdog_fired {
            return None;
        }
        if elapsed > self.config.watchdog_timeout_ms {
            self.watchdog_fired = true;
            warn!(
                "no connectivity for {}s (limit {}s); restarting",
                elapsed / 1000,
                self.config.watchdog_timeout_ms / 1000
            );
            return Some(format!("no connectivity for {}s", elapsed / 1000));
        }
        None
    }
}
