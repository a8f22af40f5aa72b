use core::fmt::{self, Write};

use crate::{
    config::DeviceConfig,
    http::PageBuffer,
    shared::ActuatorState,
    store::StoreError,
    types::{LedColor, SensorReadings},
};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

const PAGE_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:1.5rem auto;padding:0 1rem;color:#111}
    .card{border:1px solid #ddd;border-radius:10px;padding:.8rem 1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.45rem;box-sizing:border-box}
    a.btn,button{display:inline-block;padding:.45rem .8rem;margin:.2rem .2rem .2rem 0;border:1px solid #888;border-radius:6px;color:#111;text-decoration:none}
    .on{color:#106010}.off{color:#a00000}.muted{color:#555}
    nav a{margin-right:.8rem}
  </style>
"#;

const NAV: &str = r#"<nav><a href="/">Status</a><a href="/control">Control</a><a href="/telemetry">Telemetry</a><a href="/setup">Setup</a></nav>
"#;

const COLOR_CHOICES: [LedColor; 7] = [
    LedColor::Red,
    LedColor::Green,
    LedColor::Blue,
    LedColor::Yellow,
    LedColor::Cyan,
    LedColor::Magenta,
    LedColor::White,
];

/// Escapes text for element content and double-quoted attributes.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn render(title: &str, body: impl FnOnce(&mut PageBuffer) -> fmt::Result) -> String {
    let mut page = PageBuffer::new();
    // PageBuffer clamps instead of failing.
    let _ = write!(page, "{PAGE_HEAD}  <title>{}</title>\n</head>\n<body>\n<h1>{}</h1>\n{NAV}", escape(title), escape(title))
        .and_then(|()| body(&mut page))
        .and_then(|()| page.write_str("</body>\n</html>\n"));
    page.finish()
}

fn on_off(value: bool) -> &'static str {
    if value {
        r#"<span class="on">ON</span>"#
    } else {
        r#"<span class="off">OFF</span>"#
    }
}

pub fn status_page(config: &DeviceConfig, link_up: bool, broker_connected: bool) -> String {
    render("Sensor Station", |page| {
        writeln!(page, r#"<div class="card">"#)?;
        writeln!(page, "<p>Device: <b>{}</b></p>", escape(config.device_id.as_str()))?;
        writeln!(page, "<p>Location: {}</p>", escape(config.location.as_str()))?;
        writeln!(page, "<p>WiFi: {}</p>", on_off(link_up))?;
        writeln!(
            page,
            "<p>Broker: {} ({}:{})</p>",
            on_off(broker_connected),
            escape(config.broker_host.as_str()),
            config.broker_port
        )?;
        writeln!(page, "<p>Topic: {}</p>", escape(config.topic.as_str()))?;
        writeln!(page, r#"<p class="muted">Firmware {FIRMWARE_VERSION}</p>"#)?;
        writeln!(page, "</div>")
    })
}

fn toggle_row(page: &mut PageBuffer, label: &str, route: &str, value: bool) -> fmt::Result {
    writeln!(
        page,
        r#"<p>{label}: {} <a class="btn" href="/{route}?state=on">On</a><a class="btn" href="/{route}?state=off">Off</a></p>"#,
        on_off(value)
    )
}

pub fn control_page(
    actuators: &ActuatorState,
    watchdog_enabled: bool,
    watchdog_remaining_s: Option<u64>,
) -> String {
    render("Device Control", |page| {
        writeln!(page, r#"<div class="card"><h2>Actuators</h2>"#)?;
        toggle_row(page, "LED", "led", actuators.led_on)?;
        write!(page, "<p>Colour: {} ", actuators.led_color.as_str())?;
        for color in COLOR_CHOICES {
            write!(
                page,
                r#"<a class="btn" href="/led?color={0}">{0}</a>"#,
                color.as_str()
            )?;
        }
        writeln!(page, "</p>")?;
        toggle_row(page, "Display", "display", actuators.display_on)?;
        toggle_row(page, "WiFi LED", "wifiled", actuators.wifi_led)?;
        toggle_row(page, "Azure LED", "azureled", actuators.azure_led)?;
        toggle_row(page, "User LED", "userled", actuators.user_led)?;
        writeln!(page, "</div>")?;

        writeln!(page, r#"<div class="card"><h2>Display text</h2>"#)?;
        for (index, line) in actuators.display_lines.iter().enumerate() {
            writeln!(
                page,
                "<p>Line {}: {}</p>",
                index + 1,
                line.as_deref().map(escape).unwrap_or_else(|| "(status)".to_string())
            )?;
        }
        writeln!(
            page,
            r#"<form action="/display"><label>Line 1</label><input name="msg1"><button>Show</button></form>"#
        )?;
        writeln!(page, "</div>")?;

        writeln!(page, r#"<div class="card"><h2>Watchdog</h2>"#)?;
        writeln!(
            page,
            r#"<p>Watchdog: {} <a class="btn" href="/watchdog?state=enable">Enable</a><a class="btn" href="/watchdog?state=disable">Disable</a></p>"#,
            on_off(watchdog_enabled)
        )?;
        match watchdog_remaining_s {
            Some(seconds) if watchdog_enabled => {
                writeln!(page, "<p>Restart in {seconds} s without connectivity</p>")?
            }
            _ => writeln!(page, r#"<p class="muted">No restart pending</p>"#)?,
        }
        writeln!(page, r#"<p><a class="btn" href="/reset">Restart device</a></p>"#)?;
        writeln!(page, "</div>")
    })
}

pub fn telemetry_page(config: &DeviceConfig, readings: Option<&SensorReadings>) -> String {
    render("Telemetry", |page| {
        writeln!(page, r#"<div class="card">"#)?;
        writeln!(page, "<p>Device: {}</p>", escape(config.device_id.as_str()))?;
        let Some(readings) = readings else {
            writeln!(page, r#"<p class="muted">No readings yet</p>"#)?;
            return writeln!(page, "</div>");
        };

        writeln!(page, "<p>Temperature: {:.1} &deg;C</p>", readings.temperature_c)?;
        writeln!(page, "<p>Humidity: {:.1} %</p>", readings.humidity)?;
        writeln!(page, "<p>Pressure: {:.1} hPa</p>", readings.pressure_hpa)?;
        for (name, axes) in [
            ("Accelerometer", readings.accel),
            ("Gyroscope", readings.gyro),
            ("Magnetometer", readings.mag),
        ] {
            writeln!(
                page,
                "<p>{name}: x={:.2} y={:.2} z={:.2}</p>",
                axes.x, axes.y, axes.z
            )?;
        }
        writeln!(page, "</div>")
    })
}

fn text_input(page: &mut PageBuffer, label: &str, name: &str, value: &str, max: usize) -> fmt::Result {
    writeln!(
        page,
        r#"<label>{label}</label><input name="{name}" maxlength="{}" value="{}">"#,
        max.saturating_sub(1),
        escape(value)
    )
}

/// The stored WiFi password is never written into the page.
pub fn setup_page(config: &DeviceConfig) -> String {
    use crate::config::{
        BROKER_HOST_LEN, DEVICE_ID_LEN, LOCATION_LEN, MODEL_LEN, PASSWORD_LEN, SSID_LEN, TOPIC_LEN,
    };

    render("Device Setup", |page| {
        writeln!(page, r#"<form class="card" action="/save-config">"#)?;
        text_input(page, "Device ID", "device", config.device_id.as_str(), DEVICE_ID_LEN)?;
        text_input(page, "Model", "model", config.model.as_str(), MODEL_LEN)?;
        text_input(page, "Location", "location", config.location.as_str(), LOCATION_LEN)?;
        text_input(page, "WiFi SSID", "ssid", config.wifi_ssid.as_str(), SSID_LEN)?;
        writeln!(
            page,
            r#"<label>WiFi Password (leave blank to keep current)</label><input name="password" type="password" maxlength="{}">"#,
            PASSWORD_LEN - 1
        )?;
        text_input(page, "Broker host", "broker", config.broker_host.as_str(), BROKER_HOST_LEN)?;
        writeln!(
            page,
            r#"<label>Broker port</label><input name="port" type="number" min="1" max="65535" value="{}">"#,
            config.broker_port
        )?;
        text_input(page, "Topic", "topic", config.topic.as_str(), TOPIC_LEN)?;
        writeln!(page, "<button>Save</button>\n</form>")
    })
}

pub fn saved_page(config: &DeviceConfig, result: Result<(), &StoreError>) -> String {
    render("Device Setup", |page| {
        writeln!(page, r#"<div class="card">"#)?;
        match result {
            Ok(()) => writeln!(
                page,
                r#"<p class="on">Configuration saved for {}.</p>"#,
                escape(config.device_id.as_str())
            )?,
            Err(err) => writeln!(
                page,
                r#"<p class="off">Configuration not saved: {}.</p>"#,
                escape(&err.to_string())
            )?,
        }
        writeln!(
            page,
            r#"<p class="muted">Network changes take effect after <a href="/reset">restart</a>.</p>"#
        )?;
        writeln!(page, "</div>")
    })
}
