//! Main loop: link supervision, broker session upkeep, sensor publishing and
//! the local status display.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{debug, info, warn};

use crate::{
    device::{DisplaySink, Link, Restart, SensorSource, DISPLAY_LINES},
    mqtt::{MessageClient, MqttError},
    net::{Clock, Connector},
    shared::{ActuatorState, SharedContext},
    supervisor::{
        ConnectivitySupervisor, SupervisorAction, SupervisorConfig, RECONNECT_SETTLE_MS,
        RECONNECT_WAIT_MS,
    },
    types::{LedColor, SensorReadings, StatusLeds, TelemetryPayload},
};

pub const SENSOR_INTERVAL_MS: u64 = 5_000;
pub const BROKER_RETRY_MS: u64 = 10_000;
pub const LOOP_DELAY_MS: u64 = 100;
const RECONNECT_POLL_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    lines: [String; DISPLAY_LINES],
    indicator: LedColor,
    leds: StatusLeds,
}

fn due(last_ms: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    match last_ms {
        Some(last) => now_ms < last || now_ms - last >= interval_ms,
        None => true,
    }
}

pub struct Station<C: Connector, L, S, D> {
    shared: Arc<SharedContext>,
    clock: Arc<dyn Clock>,
    restart: Arc<dyn Restart>,
    client: MessageClient<C>,
    link: L,
    sensors: S,
    display: D,
    supervisor: ConnectivitySupervisor,
    last_sensor_ms: Option<u64>,
    last_broker_attempt_ms: Option<u64>,
    last_frame: Option<Frame>,
}

impl<C, L, S, D> Station<C, L, S, D>
where
    C: Connector,
    L: Link,
    S: SensorSource,
    D: DisplaySink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<SharedContext>,
        clock: Arc<dyn Clock>,
        restart: Arc<dyn Restart>,
        client: MessageClient<C>,
        link: L,
        sensors: S,
        display: D,
        supervisor: SupervisorConfig,
    ) -> Self {
        let now = clock.now_ms();
        shared.last_activity_ms.store(now, Ordering::Release);

        Self {
            supervisor: ConnectivitySupervisor::new(supervisor, now),
            shared,
            clock,
            restart,
            client,
            link,
            sensors,
            display,
            last_sensor_ms: None,
            last_broker_attempt_ms: None,
            last_frame: None,
        }
    }

    pub fn client(&self) -> &MessageClient<C> {
        &self.client
    }

    pub fn supervisor(&self) -> &ConnectivitySupervisor {
        &self.supervisor
    }

    pub fn run(&mut self, running: &AtomicBool) {
        info!("station loop started");
        while SharedContext::flag(running) {
            self.tick();
            self.clock.sleep_ms(LOOP_DELAY_MS);
        }
        self.client.disconnect();
        info!("station loop stopped");
    }

    pub fn tick(&mut self) {
        let now = self.clock.now_ms();

        if self.shared.take_watchdog_rearm() {
            self.supervisor.rearm(now);
        }
        self.supervisor
            .set_watchdog_enabled(SharedContext::flag(&self.shared.watchdog_enabled), now);

        let link_up = self.link.is_connected();
        SharedContext::set_flag(&self.shared.link_up, link_up);
        self.supervisor
            .observe_server(SharedContext::flag(&self.shared.server_bound));

        for action in self.supervisor.tick(now, link_up) {
            match action {
                SupervisorAction::StartControlServer => {
                    SharedContext::set_flag(&self.shared.server_wanted, true)
                }
                SupervisorAction::StopControlServer => {
                    SharedContext::set_flag(&self.shared.server_wanted, false)
                }
                SupervisorAction::DropBrokerSession => {
                    if self.client.connected() {
                        self.client.disconnect();
                    }
                }
                SupervisorAction::ReconnectLink => self.reconnect_link(),
                SupervisorAction::Restart { reason } => {
                    self.display.clear();
                    self.display.show_line(0, "Watchdog restart");
                    self.display.set_indicator(LedColor::Red);
                    self.restart.restart(&reason);
                    return;
                }
            }
        }
        self.shared
            .last_activity_ms
            .store(self.supervisor.last_activity_ms(), Ordering::Release);

        let link_up = SharedContext::flag(&self.shared.link_up);
        if link_up {
            self.maintain_broker(now);
        }

        if due(self.last_sensor_ms, now, SENSOR_INTERVAL_MS) {
            self.last_sensor_ms = Some(now);
            self.sample_and_publish(now);
        }

        let broker_up = self.client.connected();
        SharedContext::set_flag(&self.shared.broker_connected, broker_up);
        self.render(link_up, broker_up);
    }

    fn reconnect_link(&mut self) {
        let config = self.shared.config();
        info!("reconnecting wifi to `{}`", config.wifi_ssid);

        self.link.disconnect();
        self.clock.sleep_ms(RECONNECT_SETTLE_MS);
        self.link
            .begin(config.wifi_ssid.as_str(), config.wifi_password.as_str());

        let start = self.clock.now_ms();
        let mut up = self.link.is_connected();
        while !up && self.clock.now_ms().saturating_sub(start) < RECONNECT_WAIT_MS {
            self.clock.sleep_ms(RECONNECT_POLL_MS);
            up = self.link.is_connected();
        }

        self.supervisor.reconnect_finished(self.clock.now_ms(), up);
        SharedContext::set_flag(&self.shared.link_up, up);
    }

    fn maintain_broker(&mut self, now: u64) {
        if self.client.connected() || !due(self.last_broker_attempt_ms, now, BROKER_RETRY_MS) {
            return;
        }
        self.last_broker_attempt_ms = Some(now);

        let config = self.shared.config();
        let host = config.broker_host.as_str();
        if let Err(err) = self.client.names_mut().seed_literal(host) {
            warn!("cannot seed broker address: {err}");
        }

        match self
            .client
            .connect(host, config.broker_port_u16(), config.device_id.as_str())
        {
            Ok(()) => info!("broker connected"),
            Err(err) => debug!("broker connect attempt failed: {err}"),
        }
    }

    fn sample_and_publish(&mut self, now: u64) {
        let Some(readings) = self.sensors.read() else {
            warn!("sensor read failed; skipping cycle");
            return;
        };
        self.shared.set_telemetry(readings);

        if !self.client.connected() {
            return;
        }

        let config = self.shared.config();
        let payload = TelemetryPayload::new(
            config.device_id.as_str(),
            config.model.as_str(),
            config.location.as_str(),
            now,
            &readings,
        );
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode telemetry: {err}");
                return;
            }
        };

        match self.client.publish(config.topic.as_str(), &body) {
            Ok(()) => debug!("telemetry published ({} bytes)", body.len()),
            Err(MqttError::PayloadTooLarge { len, limit }) => {
                warn!("telemetry frame too large ({len} > {limit}); skipped")
            }
            Err(err) => warn!("telemetry publish failed: {err}"),
        }
    }

    fn render(&mut self, link_up: bool, broker_up: bool) {
        let actuators = self.shared.actuators();
        let frame = compose_frame(
            self.shared.config().device_id.as_str(),
            self.shared.telemetry().as_ref(),
            &actuators,
            link_up,
            broker_up,
        );
        if self.last_frame.as_ref() == Some(&frame) {
            return;
        }

        if frame.lines.iter().all(String::is_empty) {
            self.display.clear();
        } else {
            for (index, line) in frame.lines.iter().enumerate() {
                self.display.show_line(index, line);
            }
        }
        self.display.set_indicator(frame.indicator);
        self.display.set_status_leds(frame.leds);
        self.last_frame = Some(frame);
    }
}

/// Status lines (operator overrides win), indicator colour and status LEDs.
fn compose_frame(
    device_id: &str,
    readings: Option<&SensorReadings>,
    actuators: &ActuatorState,
    link_up: bool,
    broker_up: bool,
) -> Frame {
    let indicator = if !actuators.led_on {
        LedColor::Off
    } else if actuators.led_color != LedColor::Off {
        actuators.led_color
    } else if broker_up {
        LedColor::Green
    } else if link_up {
        LedColor::Yellow
    } else {
        LedColor::Red
    };

    let leds = StatusLeds {
        wifi: actuators.wifi_led && link_up,
        broker: actuators.azure_led && broker_up,
        user: actuators.user_led,
    };

    if !actuators.display_on {
        return Frame {
            lines: Default::default(),
            indicator,
            leds,
        };
    }

    let (climate, pressure) = match readings {
        Some(r) => (
            format!("T:{:.1}C H:{:.1}%", r.temperature_c, r.humidity),
            format!("P:{:.1}hPa", r.pressure_hpa),
        ),
        None => ("T:--.-C H:--.-%".to_string(), "P:----hPa".to_string()),
    };
    let status = format!(
        "WiFi:{} MQTT:{}",
        if link_up { "OK" } else { "--" },
        if broker_up { "OK" } else { "--" }
    );

    let generated = [device_id.to_string(), climate, pressure, status];
    let lines = std::array::from_fn(|index| {
        actuators.display_lines[index]
            .clone()
            .unwrap_or_else(|| generated[index].clone())
    });
    Frame {
        lines,
        indicator,
        leds,
    }
}
