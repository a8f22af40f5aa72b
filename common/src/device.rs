//! Hardware collaborators the station drives but does not implement.

use crate::types::{LedColor, SensorReadings, StatusLeds};

pub const DISPLAY_LINES: usize = 4;

pub trait SensorSource: Send {
    /// `None` when the sensors could not be read this cycle.
    fn read(&mut self) -> Option<SensorReadings>;
}

pub trait DisplaySink: Send {
    fn show_line(&mut self, index: usize, text: &str);
    fn clear(&mut self);
    fn set_indicator(&mut self, color: LedColor);
    fn set_status_leds(&mut self, leds: StatusLeds);
}

/// Wireless link.
pub trait Link: Send {
    fn is_connected(&mut self) -> bool;
    fn disconnect(&mut self);
    /// Starts association; completion is observed through `is_connected`.
    fn begin(&mut self, ssid: &str, password: &str);
}

/// Device reboot. Real implementations do not return.
pub trait Restart: Send + Sync {
    fn restart(&self, reason: &str);
}
