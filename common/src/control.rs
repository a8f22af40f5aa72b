//! Single-client control panel: one connection is accepted, answered and
//! closed before the next is looked at.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use embedded_storage::nor_flash::NorFlash;
use log::{debug, info, warn};

use crate::{
    config::{
        DeviceConfig, BROKER_HOST_LEN, DEFAULT_BROKER_PORT, DEVICE_ID_LEN, LOCATION_LEN,
        MODEL_LEN, PASSWORD_LEN, SSID_LEN, TOPIC_LEN,
    },
    device::{Restart, DISPLAY_LINES},
    http::{read_request, write_response, HttpRequest},
    net::{Bind, Clock, Listener, Stream},
    pages,
    shared::SharedContext,
    store::{ConfigStore, StoreError},
    supervisor::{STATUS_CHECK_INTERVAL_MS, WATCHDOG_TIMEOUT_MS},
    types::LedColor,
};

/// Minimum spacing between accepted LED or display changes.
pub const ACTUATOR_DEBOUNCE_MS: u64 = 1_000;
pub const DISPLAY_LINE_CAPACITY: usize = 64;
const CMD_CAPACITY: usize = 16;
const WORKER_IDLE_MS: u64 = 10;
/// Wait after a failed bind before trying again.
pub const BIND_RETRY_MS: u64 = STATUS_CHECK_INTERVAL_MS;

const LINE_KEYS: [&str; DISPLAY_LINES] = ["msg1", "msg2", "msg3", "msg4"];

#[derive(Debug, Clone, Copy)]
struct Debounce {
    interval_ms: u64,
    last_ms: Option<u64>,
}

impl Debounce {
    const fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    /// A clock that went backwards rebases the window instead of blocking changes.
    fn accept(&mut self, now_ms: u64) -> bool {
        match self.last_ms {
            Some(last) if now_ms >= last && now_ms - last < self.interval_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "enable" | "1" | "true" => Some(true),
        "off" | "disable" | "0" | "false" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: String,
    pub restart_after: bool,
}

impl Reply {
    fn page(body: String) -> Self {
        Self {
            body,
            restart_after: false,
        }
    }
}

pub struct ControlServer<F> {
    store: ConfigStore<F>,
    shared: Arc<SharedContext>,
    clock: Arc<dyn Clock>,
    restart: Arc<dyn Restart>,
    watchdog_timeout_ms: u64,
    led_debounce: Debounce,
    display_debounce: Debounce,
    bind_retry_at_ms: Option<u64>,
}

impl<F: NorFlash> ControlServer<F> {
    pub fn new(
        store: ConfigStore<F>,
        shared: Arc<SharedContext>,
        clock: Arc<dyn Clock>,
        restart: Arc<dyn Restart>,
    ) -> Self {
        Self {
            store,
            shared,
            clock,
            restart,
            watchdog_timeout_ms: WATCHDOG_TIMEOUT_MS,
            led_debounce: Debounce::new(ACTUATOR_DEBOUNCE_MS),
            display_debounce: Debounce::new(ACTUATOR_DEBOUNCE_MS),
            bind_retry_at_ms: None,
        }
    }

    pub fn with_watchdog_timeout(mut self, timeout_ms: u64) -> Self {
        self.watchdog_timeout_ms = timeout_ms;
        self
    }

    pub fn store(&self) -> &ConfigStore<F> {
        &self.store
    }

    /// Serves one connection and closes it. A `/reset` restarts after the page is flushed.
    pub fn handle_connection<S: Stream>(&mut self, stream: &mut S) -> io::Result<()> {
        let request = match read_request(stream, self.clock.as_ref()) {
            Ok(Some(request)) => request,
            Ok(None) => {
                stream.close();
                return Ok(());
            }
            Err(err) => {
                stream.close();
                return Err(err);
            }
        };

        debug!("control request {:?} {}", request.method, request.full_path);
        let reply = self.route(&request);
        let written = write_response(stream, &reply.body);
        stream.close();

        if reply.restart_after {
            warn!("restart requested from control panel");
            self.restart.restart("control panel reset");
        }
        written
    }

    pub fn route(&mut self, request: &HttpRequest) -> Reply {
        match request.path.as_str() {
            "/" => {
                self.apply_legacy_commands(request);
                Reply::page(self.status_page())
            }
            "/control" => Reply::page(self.control_page()),
            "/telemetry" => {
                let config = self.shared.config();
                Reply::page(pages::telemetry_page(&config, self.shared.telemetry().as_ref()))
            }
            "/setup" => Reply::page(pages::setup_page(&self.shared.config())),
            "/save-config" => Reply::page(self.save_config(request)),
            "/led" => {
                self.handle_led(request);
                Reply::page(self.control_page())
            }
            "/display" => {
                self.handle_display(request);
                Reply::page(self.control_page())
            }
            "/wifiled" | "/azureled" | "/userled" => {
                self.handle_indicator(request);
                Reply::page(self.control_page())
            }
            "/watchdog" => {
                self.handle_watchdog(request);
                Reply::page(self.control_page())
            }
            "/reset" => Reply {
                body: self.control_page(),
                restart_after: true,
            },
            _ => Reply::page(self.status_page()),
        }
    }

    fn status_page(&self) -> String {
        pages::status_page(
            &self.shared.config(),
            SharedContext::flag(&self.shared.link_up),
            SharedContext::flag(&self.shared.broker_connected),
        )
    }

    fn control_page(&self) -> String {
        let watchdog_enabled = SharedContext::flag(&self.shared.watchdog_enabled);
        pages::control_page(
            &self.shared.actuators(),
            watchdog_enabled,
            Some(self.watchdog_remaining_ms() / 1000),
        )
    }

    /// Time left before the inactivity restart, as last published by the main loop.
    pub fn watchdog_remaining_ms(&self) -> u64 {
        let last = self.shared.last_activity_ms.load(Ordering::Acquire);
        let elapsed = self.clock.now_ms().saturating_sub(last);
        self.watchdog_timeout_ms.saturating_sub(elapsed)
    }

    fn apply_legacy_commands(&mut self, request: &HttpRequest) {
        if let Some(cmd) = request.param("cmd", CMD_CAPACITY) {
            let value = request
                .param("val", DISPLAY_LINE_CAPACITY)
                .unwrap_or_default();
            match cmd.as_str() {
                "led" => self.set_led_color(&value),
                "clear" => self.clear_lines(),
                other => match LINE_KEYS.iter().position(|key| *key == other) {
                    Some(index) => self.set_line(index, value),
                    None => debug!("unknown legacy command `{other}`"),
                },
            }
        }

        if let Some(color) = request.param("led", CMD_CAPACITY) {
            self.set_led_color(&color);
        }
        for (index, key) in LINE_KEYS.iter().enumerate() {
            if let Some(text) = request.param(key, DISPLAY_LINE_CAPACITY) {
                self.set_line(index, text);
            }
        }
    }

    fn set_led_color(&mut self, name: &str) {
        if !self.led_debounce.accept(self.clock.now_ms()) {
            debug!("led change ignored (debounce)");
            return;
        }
        let color = LedColor::parse(name);
        let mut actuators = self.shared.lock_actuators();
        actuators.led_color = color;
        actuators.led_on = color != LedColor::Off;
        info!("led colour set to {}", color.as_str());
    }

    fn set_line(&mut self, index: usize, text: String) {
        info!("display line {} set", index + 1);
        self.shared.lock_actuators().display_lines[index] = Some(text);
    }

    fn clear_lines(&mut self) {
        info!("display overrides cleared");
        self.shared.lock_actuators().display_lines = Default::default();
    }

    fn handle_led(&mut self, request: &HttpRequest) {
        if let Some(color) = request
            .param("color", CMD_CAPACITY)
            .or_else(|| request.param("led", CMD_CAPACITY))
        {
            self.set_led_color(&color);
            return;
        }

        let current = self.shared.lock_actuators().led_on;
        let Some(next) = requested_switch(request, current) else {
            return;
        };
        if !self.led_debounce.accept(self.clock.now_ms()) {
            debug!("led toggle ignored (debounce)");
            return;
        }
        self.shared.lock_actuators().led_on = next;
        info!("led {}", if next { "on" } else { "off" });
    }

    fn handle_display(&mut self, request: &HttpRequest) {
        let lines: Vec<(usize, String)> = LINE_KEYS
            .iter()
            .enumerate()
            .filter_map(|(index, key)| Some((index, request.param(key, DISPLAY_LINE_CAPACITY)?)))
            .collect();
        let current = self.shared.lock_actuators().display_on;
        let switch = if lines.is_empty() {
            requested_switch(request, current)
        } else {
            request.param("state", CMD_CAPACITY).and_then(|v| parse_switch(&v))
        };

        if lines.is_empty() && switch.is_none() {
            return;
        }
        if !self.display_debounce.accept(self.clock.now_ms()) {
            debug!("display change ignored (debounce)");
            return;
        }

        let mut actuators = self.shared.lock_actuators();
        for (index, text) in lines {
            actuators.display_lines[index] = Some(text);
        }
        if let Some(on) = switch {
            actuators.display_on = on;
            info!("display {}", if on { "on" } else { "off" });
        }
    }

    fn handle_indicator(&mut self, request: &HttpRequest) {
        let mut actuators = self.shared.lock_actuators();
        let slot = match request.path.as_str() {
            "/wifiled" => &mut actuators.wifi_led,
            "/azureled" => &mut actuators.azure_led,
            _ => &mut actuators.user_led,
        };
        if let Some(next) = requested_switch(request, *slot) {
            *slot = next;
            info!("{} {}", &request.path[1..], if next { "on" } else { "off" });
        }
    }

    fn handle_watchdog(&mut self, request: &HttpRequest) {
        let current = SharedContext::flag(&self.shared.watchdog_enabled);
        if let Some(enabled) = requested_switch(request, current) {
            self.shared.set_watchdog_enabled(enabled);
            info!("watchdog {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    fn save_config(&mut self, request: &HttpRequest) -> String {
        let mut config = self.shared.config();
        apply_config_params(&mut config, request);

        let result = self.store.save(&config);
        match &result {
            Ok(()) => self.shared.set_config(self.store.get_config().clone()),
            Err(err @ StoreError::WriteFailed { .. }) => {
                warn!("failed to persist configuration ({err}); falling back to defaults");
                self.store.reset_to_defaults();
                self.shared.set_config(self.store.get_config().clone());
            }
            Err(err) => warn!("failed to persist configuration ({err}); keeping current settings"),
        }
        pages::saved_page(self.store.get_config(), result.as_ref().map(|_| ()))
    }

    /// Runs the accept loop until `running` is cleared.
    pub fn run<B: Bind>(mut self, mut bind: B, running: &AtomicBool) {
        let mut listener = None;
        while SharedContext::flag(running) {
            if !self.poll(&mut bind, &mut listener) {
                self.clock.sleep_ms(WORKER_IDLE_MS);
            }
        }
        SharedContext::set_flag(&self.shared.server_bound, false);
    }

    /// Binds or drops the listener to follow `server_wanted`, then serves at
    /// most one client. Returns whether a client was served.
    pub fn poll<B: Bind>(&mut self, bind: &mut B, listener: &mut Option<B::Listener>) -> bool {
        let wanted = SharedContext::flag(&self.shared.server_wanted);

        if wanted && listener.is_none() && self.bind_due() {
            match bind.bind() {
                Ok(bound) => {
                    info!("control server listening");
                    self.bind_retry_at_ms = None;
                    *listener = Some(bound);
                }
                Err(err) => {
                    warn!("control server bind failed: {err}; retrying in {BIND_RETRY_MS}ms");
                    self.bind_retry_at_ms = Some(self.clock.now_ms().saturating_add(BIND_RETRY_MS));
                }
            }
        } else if !wanted {
            self.bind_retry_at_ms = None;
            if listener.take().is_some() {
                info!("control server stopped");
            }
        }
        SharedContext::set_flag(&self.shared.server_bound, listener.is_some());

        let Some(active) = listener.as_mut() else {
            return false;
        };
        match active.accept() {
            Ok(Some(mut stream)) => {
                if let Err(err) = self.handle_connection(&mut stream) {
                    warn!("control connection error: {err}");
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("control accept failed: {err}");
                false
            }
        }
    }

    /// A clock that went backwards past the retry window allows an immediate retry.
    fn bind_due(&self) -> bool {
        match self.bind_retry_at_ms {
            Some(at) => {
                let now = self.clock.now_ms();
                now >= at || at - now > BIND_RETRY_MS
            }
            None => true,
        }
    }
}

/// `state=on|off|enable|disable`; a request without `state` flips `current`.
fn requested_switch(request: &HttpRequest, current: bool) -> Option<bool> {
    match request.param("state", CMD_CAPACITY) {
        Some(value) => parse_switch(&value),
        None => Some(!current),
    }
}

/// Copies `/save-config` parameters into `config`. An absent or empty password
/// keeps the stored one; an unusable port falls back to the default.
pub fn apply_config_params(config: &mut DeviceConfig, request: &HttpRequest) {
    if let Some(value) = request.param("device", DEVICE_ID_LEN) {
        config.device_id.set(&value);
    }
    if let Some(value) = request.param("model", MODEL_LEN) {
        config.model.set(&value);
    }
    if let Some(value) = request.param("location", LOCATION_LEN) {
        config.location.set(&value);
    }
    if let Some(value) = request.param("ssid", SSID_LEN) {
        config.wifi_ssid.set(&value);
    }
    if let Some(value) = request.param("password", PASSWORD_LEN) {
        if !value.is_empty() {
            config.wifi_password.set(&value);
        }
    }
    if let Some(value) = request.param("broker", BROKER_HOST_LEN) {
        config.broker_host.set(&value);
    }
    if let Some(value) = request.param("port", 8) {
        config.broker_port = value.trim().parse().unwrap_or(DEFAULT_BROKER_PORT);
    }
    if let Some(value) = request.param("topic", TOPIC_LEN) {
        config.topic.set(&value);
    }
    config.sanitize();
}
