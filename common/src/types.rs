use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedColor {
    #[default]
    Off,
    Red,
    Green,
    Blue,
    Yellow,
    Cyan,
    Magenta,
    White,
}

impl LedColor {
    /// Case-insensitive colour name; anything unrecognised is `Off`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "red" => Self::Red,
            "green" => Self::Green,
            "blue" => Self::Blue,
            "yellow" => Self::Yellow,
            "cyan" => Self::Cyan,
            "magenta" | "purple" => Self::Magenta,
            "white" => Self::White,
            _ => Self::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::Yellow => "yellow",
            Self::Cyan => "cyan",
            Self::Magenta => "magenta",
            Self::White => "white",
        }
    }

    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            Self::Off => (0, 0, 0),
            Self::Red => (255, 0, 0),
            Self::Green => (0, 255, 0),
            Self::Blue => (0, 0, 255),
            Self::Yellow => (255, 255, 0),
            Self::Cyan => (0, 255, 255),
            Self::Magenta => (255, 0, 255),
            Self::White => (255, 255, 255),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// The three discrete LEDs beside the RGB indicator. `wifi` mirrors the link and
/// `broker` the broker session while their switches are on; `user` is manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusLeds {
    pub wifi: bool,
    pub broker: bool,
    pub user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Axes {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Axes {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReadings {
    pub temperature_c: f32,
    pub humidity: f32,
    pub pressure_hpa: f32,
    pub accel: Axes,
    pub gyro: Axes,
    pub mag: Axes,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload<'a> {
    pub device: &'a str,
    pub model: &'a str,
    pub location: &'a str,
    pub timestamp: u64,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    pub accel: Axes,
    pub gyro: Axes,
    pub mag: Axes,
}

impl<'a> TelemetryPayload<'a> {
    pub fn new(
        device: &'a str,
        model: &'a str,
        location: &'a str,
        timestamp: u64,
        readings: &SensorReadings,
    ) -> Self {
        Self {
            device,
            model,
            location,
            timestamp,
            temperature: readings.temperature_c,
            humidity: readings.humidity,
            pressure: readings.pressure_hpa,
            accel: readings.accel,
            gyro: readings.gyro,
            mag: readings.mag,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_colour_names() {
        assert_eq!(LedColor::parse("RED"), LedColor::Red);
        assert_eq!(LedColor::parse("purple"), LedColor::Magenta);
        assert_eq!(LedColor::parse(" cyan "), LedColor::Cyan);
        assert_eq!(LedColor::parse("chartreuse"), LedColor::Off);
        assert_eq!(LedColor::Yellow.rgb(), (255, 255, 0));
    }

    #[test]
    fn telemetry_json_shape() {
        let readings = SensorReadings {
            temperature_c: 21.5,
            humidity: 40.0,
            pressure_hpa: 1013.25,
            accel: Axes::new(0.0, 0.0, 1.0),
            gyro: Axes::default(),
            mag: Axes::new(1.0, 2.0, 3.0),
        };
        let payload = TelemetryPayload::new("node", "AZ3166", "lab", 5_000, &readings);

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "device": "node",
                "model": "AZ3166",
                "location": "lab",
                "timestamp": 5000,
                "temperature": 21.5,
                "humidity": 40.0,
                "pressure": 1013.25,
                "accel": {"x": 0.0, "y": 0.0, "z": 1.0},
                "gyro": {"x": 0.0, "y": 0.0, "z": 0.0},
                "mag": {"x": 1.0, "y": 2.0, "z": 3.0},
            })
        );
    }
}
