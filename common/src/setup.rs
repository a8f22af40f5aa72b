//! Boot-time serial setup: a short window to request it, then one prompt per
//! setting with Enter keeping the current value.

use std::{
    io::{self, Read, Write},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::Duration,
};

use embedded_storage::nor_flash::NorFlash;
use log::{info, warn};

use crate::{
    config::{
        DeviceConfig, BROKER_HOST_LEN, DEFAULT_BROKER_PORT, DEVICE_ID_LEN, PASSWORD_LEN,
        SSID_LEN, TOPIC_LEN,
    },
    net::Clock,
    store::{ConfigStore, StoreError},
};

/// How long the boot banner waits for `C`.
pub const SETUP_WINDOW_MS: u64 = 5_000;
/// Per-field input timeout.
pub const FIELD_TIMEOUT_MS: u64 = 30_000;
/// Input buffer for the port prompt, terminator included.
const PORT_INPUT_LEN: usize = 8;
/// Input arriving this soon after `C` (a line ending) is discarded.
const REQUEST_SETTLE_MS: u64 = 100;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// Byte-oriented serial console.
pub trait SetupConsole {
    /// Next input byte, or `None` once `timeout_ms` passes without one.
    fn read_byte(&mut self, timeout_ms: u64) -> Option<u8>;

    fn write_str(&mut self, text: &str);

    /// Echo of accepted input. Consoles on a terminal that echoes locally skip it.
    fn echo(&mut self, text: &str) {
        self.write_str(text);
    }
}

/// Settings entered through the console. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupAnswers {
    pub device_id: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub broker_host: Option<String>,
    pub broker_port: Option<String>,
    pub topic: Option<String>,
}

impl SetupAnswers {
    /// Applies every answer. Text is truncated to the field width and a port
    /// outside 1..=65535 (or not a number) becomes 1883.
    pub fn apply(&self, config: &mut DeviceConfig) {
        if let Some(value) = &self.device_id {
            config.device_id.set(value);
        }
        if let Some(value) = &self.wifi_ssid {
            config.wifi_ssid.set(value);
        }
        if let Some(value) = &self.wifi_password {
            config.wifi_password.set(value);
        }
        if let Some(value) = &self.broker_host {
            config.broker_host.set(value);
        }
        if let Some(value) = &self.broker_port {
            config.broker_port = parse_port(value);
        }
        if let Some(value) = &self.topic {
            config.topic.set(value);
        }
    }
}

/// Leading decimal digits as a port; anything else maps to the default.
pub fn parse_port(text: &str) -> u32 {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    match digits.parse::<u32>() {
        Ok(port) if (1..=u32::from(u16::MAX)).contains(&port) => port,
        _ => DEFAULT_BROKER_PORT,
    }
}

/// Prints the banner and waits up to [`SETUP_WINDOW_MS`] for `C` or `c`.
pub fn wants_setup(console: &mut dyn SetupConsole, clock: &dyn Clock) -> bool {
    console.write_str("\r\n=== Sensor Station ===\r\n");
    console.write_str("Press 'C' within 5 seconds to enter configuration mode...\r\n");

    let deadline = clock.now_ms().saturating_add(SETUP_WINDOW_MS);
    loop {
        let remaining = deadline.saturating_sub(clock.now_ms());
        if remaining == 0 {
            break;
        }
        match console.read_byte(remaining) {
            Some(b'C' | b'c') => {
                while console.read_byte(REQUEST_SETTLE_MS).is_some() {}
                console.write_str("Entering configuration mode...\r\n");
                return true;
            }
            Some(_) => {}
            None => break,
        }
    }
    console.write_str("Starting with current configuration...\r\n");
    false
}

/// One `Prompt [default]: ` line. Returns `None` when nothing was typed before
/// Enter or the timeout. At most `max_len - 1` printable characters are kept.
pub fn read_field(
    console: &mut dyn SetupConsole,
    clock: &dyn Clock,
    prompt: &str,
    current: &str,
    max_len: usize,
) -> Option<String> {
    console.write_str(&format!("{prompt} [{current}]: "));

    let mut input = String::new();
    let deadline = clock.now_ms().saturating_add(FIELD_TIMEOUT_MS);
    loop {
        let remaining = deadline.saturating_sub(clock.now_ms());
        if remaining == 0 {
            break;
        }
        let Some(byte) = console.read_byte(remaining) else {
            break;
        };
        match byte {
            b'\r' | b'\n' => break,
            BACKSPACE | DELETE => {
                if input.pop().is_some() {
                    console.echo("\x08 \x08");
                }
            }
            32..=126 if input.len() < max_len.saturating_sub(1) => {
                let c = char::from(byte);
                input.push(c);
                console.echo(c.encode_utf8(&mut [0; 4]));
            }
            _ => {}
        }
    }
    console.write_str("\r\n");

    (!input.is_empty()).then_some(input)
}

/// Walks every prompt in order against the values in `current`.
pub fn prompt_answers(
    console: &mut dyn SetupConsole,
    clock: &dyn Clock,
    current: &DeviceConfig,
) -> SetupAnswers {
    console.write_str("\r\n=== DEVICE CONFIGURATION ===\r\n");
    console.write_str("Press ENTER to keep a value, or type a new one.\r\n");
    console.write_str("Each field times out after 30 seconds.\r\n\r\n");

    SetupAnswers {
        device_id: read_field(
            console,
            clock,
            "Device ID",
            current.device_id.as_str(),
            DEVICE_ID_LEN,
        ),
        wifi_ssid: read_field(console, clock, "WiFi SSID", current.wifi_ssid.as_str(), SSID_LEN),
        wifi_password: read_field(
            console,
            clock,
            "WiFi Password",
            current.wifi_password.as_str(),
            PASSWORD_LEN,
        ),
        broker_host: read_field(
            console,
            clock,
            "MQTT Server",
            current.broker_host.as_str(),
            BROKER_HOST_LEN,
        ),
        broker_port: read_field(
            console,
            clock,
            "MQTT Port",
            &current.broker_port.to_string(),
            PORT_INPUT_LEN,
        ),
        topic: read_field(console, clock, "MQTT Topic", current.topic.as_str(), TOPIC_LEN),
    }
}

fn write_summary(console: &mut dyn SetupConsole, config: &DeviceConfig) {
    console.write_str("\r\n=== CONFIGURATION SUMMARY ===\r\n");
    console.write_str(&format!("Device ID: {}\r\n", config.device_id));
    console.write_str(&format!("WiFi SSID: {}\r\n", config.wifi_ssid));
    console.write_str("WiFi Password: ***hidden***\r\n");
    console.write_str(&format!("MQTT Server: {}\r\n", config.broker_host));
    console.write_str(&format!("MQTT Port: {}\r\n", config.broker_port));
    console.write_str(&format!("MQTT Topic: {}\r\n", config.topic));
}

/// Offers setup and, when taken, saves the edited settings.
///
/// Returns `Ok(false)` when the window passed without a request. A failed
/// program leaves the store on its defaults; a failed erase keeps the
/// previous settings.
pub fn run_setup<F: NorFlash>(
    console: &mut dyn SetupConsole,
    clock: &dyn Clock,
    store: &mut ConfigStore<F>,
) -> Result<bool, StoreError> {
    if !wants_setup(console, clock) {
        return Ok(false);
    }

    let mut config = store.get_config().clone();
    prompt_answers(console, clock, &config).apply(&mut config);
    config.sanitize();
    write_summary(console, &config);

    match store.save(&config) {
        Ok(()) => {
            console.write_str("Configuration saved to flash.\r\n");
            info!("serial setup saved configuration for `{}`", config.device_id);
            Ok(true)
        }
        Err(err) => {
            console.write_str("Warning: failed to save configuration to flash!\r\n");
            warn!("serial setup could not persist configuration: {err}");
            if matches!(err, StoreError::WriteFailed { .. }) {
                store.reset_to_defaults();
            }
            Err(err)
        }
    }
}

/// Console over any byte reader. A background thread forwards input so reads
/// can time out; the output side goes to stdout.
pub struct ReaderConsole {
    input: Receiver<u8>,
    local_echo: bool,
}

impl ReaderConsole {
    /// `local_echo` is set when the terminal already shows what is typed.
    pub fn spawn<R: Read + Send + 'static>(reader: R, local_echo: bool) -> io::Result<Self> {
        let (tx, input) = mpsc::channel();
        thread::Builder::new()
            .name("setup-input".to_string())
            .spawn(move || forward_input(reader, tx))?;
        Ok(Self { input, local_echo })
    }
}

fn forward_input<R: Read>(mut reader: R, tx: mpsc::Sender<u8>) {
    let mut byte = [0_u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(1) => {
                if tx.send(byte[0]).is_err() {
                    return;
                }
            }
            Ok(_) => return,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => {
                warn!("setup console input closed: {err}");
                return;
            }
        }
    }
}

impl SetupConsole for ReaderConsole {
    fn read_byte(&mut self, timeout_ms: u64) -> Option<u8> {
        match self.input.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(byte) => Some(byte),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    fn write_str(&mut self, text: &str) {
        let mut stdout = io::stdout().lock();
        if stdout
            .write_all(text.as_bytes())
            .and_then(|()| stdout.flush())
            .is_err()
        {
            warn!("setup console output failed");
        }
    }

    fn echo(&mut self, text: &str) {
        if !self.local_echo {
            self.write_str(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        flash::RamFlash,
        testutil::{FakeClock, FaultyFlash},
    };

    /// Replays typed bytes; `None` entries stand for a timeout. Each byte takes
    /// 100 ms of simulated time.
    struct ScriptedConsole<'a> {
        input: VecDeque<Option<u8>>,
        output: String,
        clock: &'a FakeClock,
    }

    impl<'a> ScriptedConsole<'a> {
        fn typed(clock: &'a FakeClock, text: &str) -> Self {
            Self {
                input: text.bytes().map(Some).collect(),
                output: String::new(),
                clock,
            }
        }

        /// `C`, a line ending, then a pause before `answers`.
        fn requesting(clock: &'a FakeClock, answers: &str) -> Self {
            let mut console = Self::typed(clock, "C\n");
            console.input.push_back(None);
            console.input.extend(answers.bytes().map(Some));
            console
        }
    }

    impl SetupConsole for ScriptedConsole<'_> {
        fn read_byte(&mut self, timeout_ms: u64) -> Option<u8> {
            match self.input.pop_front().flatten() {
                Some(byte) => {
                    self.clock.advance(100);
                    Some(byte)
                }
                None => {
                    self.clock.advance(timeout_ms);
                    None
                }
            }
        }

        fn write_str(&mut self, text: &str) {
            self.output.push_str(text);
        }
    }

    fn store() -> ConfigStore<RamFlash> {
        let mut store = ConfigStore::new(RamFlash::new(1), 0).unwrap();
        store.set_defaults(DeviceConfig::default());
        store
    }

    #[test]
    fn window_closes_without_request() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::typed(&clock, "xyz");
        let mut store = store();

        assert_eq!(run_setup(&mut console, &clock, &mut store), Ok(false));
        assert!(console.output.contains("Starting with current configuration"));
        assert!(!console.output.contains("Device ID"));

        let mut reloaded = ConfigStore::new(store.into_flash(), 0).unwrap();
        assert_eq!(reloaded.load().err(), Some(StoreError::NotFound));
    }

    #[test]
    fn lowercase_c_enters_setup_after_noise() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::typed(&clock, "zzc\r\n");
        assert!(wants_setup(&mut console, &clock));
        assert!(console.output.contains("Entering configuration mode"));
        assert!(console.input.is_empty());
    }

    #[test]
    fn window_expires_on_the_clock() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::typed(&clock, &"x".repeat(60));
        assert!(!wants_setup(&mut console, &clock));
        assert_eq!(console.input.len(), 10);
    }

    #[test]
    fn enter_keeps_values_and_typed_values_replace_them() {
        let clock = FakeClock::new(0);
        let script = "porch-node\r\
                      \r\
                      hunter2\r\
                      10.0.0.5\r\
                      8883\r\
                      \r";
        let mut console = ScriptedConsole::requesting(&clock, script);
        let mut store = store();

        assert_eq!(run_setup(&mut console, &clock, &mut store), Ok(true));

        let saved = store.get_config().clone();
        assert_eq!(saved.device_id.as_str(), "porch-node");
        assert_eq!(saved.wifi_ssid.as_str(), DeviceConfig::default().wifi_ssid.as_str());
        assert_eq!(saved.wifi_password.as_str(), "hunter2");
        assert_eq!(saved.broker_host.as_str(), "10.0.0.5");
        assert_eq!(saved.broker_port, 8883);
        assert_eq!(saved.topic.as_str(), "sensors/az3166");

        let mut reloaded = ConfigStore::new(store.into_flash(), 0).unwrap();
        assert_eq!(reloaded.load().cloned(), Ok(saved));
    }

    #[test]
    fn prompts_show_current_values_and_summary_hides_password() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::requesting(&clock, "\r\r\r\r\r\r");
        let mut store = store();
        run_setup(&mut console, &clock, &mut store).unwrap();

        let expected_prompts = [
            "Device ID [SensorStation_01]: ",
            "WiFi SSID [YourWiFiNetwork]: ",
            "MQTT Server [mqtt.example.com]: ",
            "MQTT Port [1883]: ",
            "MQTT Topic [sensors/az3166]: ",
        ];
        for prompt in expected_prompts {
            assert!(console.output.contains(prompt), "missing `{prompt}`");
        }
        assert!(console.output.contains("WiFi Password: ***hidden***"));
        let summary = console.output.split("CONFIGURATION SUMMARY").nth(1).unwrap();
        assert!(!summary.contains(DeviceConfig::default().wifi_password.as_str()));
    }

    #[test]
    fn backspace_and_control_bytes_are_edited_out() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::typed(&clock, "nodx\x08e\x7f\x7fde\x01\t-2\r");
        let field = read_field(&mut console, &clock, "Device ID", "old", DEVICE_ID_LEN);
        assert_eq!(field.as_deref(), Some("node-2"));
        assert!(console.output.contains("\x08 \x08"));
    }

    #[test]
    fn backspace_on_empty_input_echoes_nothing() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::typed(&clock, "\x08\r");
        assert_eq!(read_field(&mut console, &clock, "MQTT Topic", "t", TOPIC_LEN), None);
        assert!(!console.output.contains('\x08'));
    }

    #[test]
    fn input_stops_one_short_of_the_field_width() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::typed(&clock, &format!("{}\r", "9".repeat(20)));
        let port = read_field(&mut console, &clock, "MQTT Port", "1883", PORT_INPUT_LEN);
        assert_eq!(port.as_deref(), Some("9999999"));
    }

    #[test]
    fn timeout_keeps_partial_input() {
        let clock = FakeClock::new(0);
        let mut console = ScriptedConsole::typed(&clock, "lab");
        console.input.push_back(None);
        console.input.push_back(Some(b'x'));

        let field = read_field(&mut console, &clock, "Device ID", "old", DEVICE_ID_LEN);
        assert_eq!(field.as_deref(), Some("lab"));
        assert_eq!(clock.now_ms(), FIELD_TIMEOUT_MS);
        assert_eq!(console.input.len(), 1);
    }

    #[test]
    fn out_of_range_ports_fall_back() {
        assert_eq!(parse_port("8883"), 8883);
        assert_eq!(parse_port(" 1884abc"), 1884);
        assert_eq!(parse_port("0"), DEFAULT_BROKER_PORT);
        assert_eq!(parse_port("65536"), DEFAULT_BROKER_PORT);
        assert_eq!(parse_port("-5"), DEFAULT_BROKER_PORT);
        assert_eq!(parse_port("mqtt"), DEFAULT_BROKER_PORT);
    }

    #[test]
    fn failed_program_leaves_defaults_in_place() {
        let clock = FakeClock::new(0);
        let mut flash = FaultyFlash::new(RamFlash::new(1));
        flash.fail_after_writes = Some(0);
        let mut store = ConfigStore::new(flash, 0).unwrap();
        store.set_defaults(DeviceConfig::default());
        let mut console = ScriptedConsole::requesting(&clock, "other\r\r\r\r\r\r");

        let result = run_setup(&mut console, &clock, &mut store);
        assert!(matches!(result, Err(StoreError::WriteFailed { word: 0, .. })));
        assert_eq!(store.get_config(), &DeviceConfig::default().sealed());
        assert!(console.output.contains("failed to save configuration"));
    }

    #[test]
    fn reader_console_times_out_after_input_ends() {
        let mut console = ReaderConsole::spawn(io::Cursor::new(b"C".to_vec()), true).unwrap();
        assert_eq!(console.read_byte(1_000), Some(b'C'));
        assert_eq!(console.read_byte(20), None);
    }
}
