//! State shared between the main loop and the control worker.
//!
//! | field | written by | read by |
//! |---|---|---|
//! | `config` | control worker (`/save-config`) | main loop |
//! | `actuators` | control worker | main loop |
//! | `telemetry` | main loop | control worker |
//! | `link_up`, `broker_connected`, `server_wanted`, `last_activity_ms` | main loop | control worker |
//! | `server_bound` | control worker | main loop |
//! | `watchdog_enabled`, `watchdog_rearm` | control worker | main loop |
//!
//! Locks are only held to copy values in or out.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex, MutexGuard, PoisonError, RwLock,
};

use crate::{
    config::DeviceConfig,
    device::DISPLAY_LINES,
    types::{LedColor, SensorReadings},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorState {
    pub led_on: bool,
    pub led_color: LedColor,
    pub display_on: bool,
    pub wifi_led: bool,
    pub azure_led: bool,
    pub user_led: bool,
    /// Operator text that replaces the generated status line.
    pub display_lines: [Option<String>; DISPLAY_LINES],
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self {
            led_on: true,
            led_color: LedColor::Off,
            display_on: true,
            wifi_led: true,
            azure_led: true,
            user_led: false,
            display_lines: Default::default(),
        }
    }
}

#[derive(Debug)]
pub struct SharedContext {
    pub config: RwLock<DeviceConfig>,
    pub actuators: Mutex<ActuatorState>,
    pub telemetry: Mutex<Option<SensorReadings>>,
    pub link_up: AtomicBool,
    pub broker_connected: AtomicBool,
    pub server_wanted: AtomicBool,
    pub server_bound: AtomicBool,
    pub watchdog_enabled: AtomicBool,
    pub watchdog_rearm: AtomicBool,
    pub last_activity_ms: AtomicU64,
}

impl SharedContext {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config: RwLock::new(config),
            actuators: Mutex::new(ActuatorState::default()),
            telemetry: Mutex::new(None),
            link_up: AtomicBool::new(false),
            broker_connected: AtomicBool::new(false),
            server_wanted: AtomicBool::new(false),
            server_bound: AtomicBool::new(false),
            watchdog_enabled: AtomicBool::new(true),
            watchdog_rearm: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_config(&self, config: DeviceConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn actuators(&self) -> ActuatorState {
        self.lock_actuators().clone()
    }

    pub fn lock_actuators(&self) -> MutexGuard<'_, ActuatorState> {
        self.actuators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn telemetry(&self) -> Option<SensorReadings> {
        *self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_telemetry(&self, readings: SensorReadings) {
        *self.telemetry.lock().unwrap_or_else(PoisonError::into_inner) = Some(readings);
    }

    pub fn flag(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Acquire)
    }

    pub fn set_flag(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Release);
    }

    /// Watchdog switch from the control panel. Re-enabling asks the main loop
    /// to restart the inactivity window.
    pub fn set_watchdog_enabled(&self, enabled: bool) {
        let was = self.watchdog_enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was {
            self.watchdog_rearm.store(true, Ordering::Release);
        }
    }

    pub fn take_watchdog_rearm(&self) -> bool {
        self.watchdog_rearm.swap(false, Ordering::AcqRel)
    }
}
