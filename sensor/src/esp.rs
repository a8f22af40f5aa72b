use core::ffi::c_void;
use std::{
    ffi::CString,
    io::{self, Read},
    net::{Ipv4Addr, SocketAddr},
    sync::{atomic::AtomicBool, Arc},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, OutputPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sys,
    wifi::EspWifi,
};
use log::{info, warn};

use station_common::{
    resolve::parse_host_list, run_setup, store::StoreError, Axes, Clock, ConfigStore,
    ControlServer, DeviceConfig, DisplaySink, LedColor, Link, MessageClient, NameCache,
    ReaderConsole, Restart, SensorReadings, SensorSource, SharedContext, Station, StatusLeds, SupervisorConfig,
    SystemClock, TcpBind, TcpConnector,
};

const CONFIG_PARTITION: &str = "config";
const PARTITION_ERASE_SIZE: usize = 4096;
const PARTITION_WRITE_SIZE: usize = 4;

const DHT11_PIN: i32 = 16;
const CONTROL_PORT: u16 = 80;
const TASK_WATCHDOG_TIMEOUT_SEC: u32 = 30;
const MAIN_LOOP_DELAY_MS: u64 = 100;

/// Raw data partition addressed through the IDF partition API.
struct PartitionFlash {
    partition: *const sys::esp_partition_t,
    size: usize,
}

// The partition table entry is static for the lifetime of the firmware.
unsafe impl Send for PartitionFlash {}

impl PartitionFlash {
    fn find(label: &str) -> anyhow::Result<Self> {
        let label = CString::new(label)?;
        let partition = unsafe {
            sys::esp_partition_find_first(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
                sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                label.as_ptr(),
            )
        };
        if partition.is_null() {
            return Err(anyhow!("partition `{}` not found", label.to_string_lossy()));
        }
        let size = unsafe { (*partition).size } as usize;
        info!("config partition `{}` ({size} bytes)", label.to_string_lossy());
        Ok(Self { partition, size })
    }

    fn check(&self, offset: u32, len: usize) -> Result<(), NorFlashErrorKind> {
        match (offset as usize).checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(NorFlashErrorKind::OutOfBounds),
        }
    }
}

fn esp_result(rc: sys::esp_err_t, op: &str) -> Result<(), NorFlashErrorKind> {
    if rc == sys::ESP_OK {
        Ok(())
    } else {
        warn!("partition {op} failed: esp_err_t={rc}");
        Err(NorFlashErrorKind::Other)
    }
}

impl ErrorType for PartitionFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for PartitionFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len())?;
        let rc = unsafe {
            sys::esp_partition_read(
                self.partition,
                offset as usize,
                bytes.as_mut_ptr().cast::<c_void>(),
                bytes.len(),
            )
        };
        esp_result(rc, "read")
    }

    fn capacity(&self) -> usize {
        self.size
    }
}

impl NorFlash for PartitionFlash {
    const WRITE_SIZE: usize = PARTITION_WRITE_SIZE;
    const ERASE_SIZE: usize = PARTITION_ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let len = (to - from) as usize;
        self.check(from, len)?;
        let rc = unsafe { sys::esp_partition_erase_range(self.partition, from as usize, len) };
        esp_result(rc, "erase")
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        self.check(offset, bytes.len())?;
        let rc = unsafe {
            sys::esp_partition_write(
                self.partition,
                offset as usize,
                bytes.as_ptr().cast::<c_void>(),
                bytes.len(),
            )
        };
        esp_result(rc, "write")
    }
}

/// DHT11 only; the remaining channels report zero.
struct Dht11Sensors {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht11Sensors {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl SensorSource for Dht11Sensors {
    fn read(&mut self) -> Option<SensorReadings> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT11 line high before read: {err:?}");
            return None;
        }

        match dht11::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => Some(SensorReadings {
                temperature_c: f32::from(reading.temperature),
                humidity: f32::from(reading.relative_humidity),
                pressure_hpa: 0.0,
                accel: Axes::default(),
                gyro: Axes::default(),
                mag: Axes::default(),
            }),
            Err(err) => {
                warn!("failed to read DHT11 on GPIO{DHT11_PIN}: {err:?}");
                None
            }
        }
    }
}

type LedPin = PinDriver<'static, AnyOutputPin, Output>;

/// Display lines go to the log. The indicator drives a common-cathode RGB LED and
/// the status LEDs are active high.
struct LedPanel {
    red: LedPin,
    green: LedPin,
    blue: LedPin,
    wifi: LedPin,
    broker: LedPin,
    user: LedPin,
    lines: [String; 4],
}

impl LedPanel {
    /// `rgb` is red, green, blue; `status` is wifi, broker, user.
    fn new(rgb: [AnyOutputPin; 3], status: [AnyOutputPin; 3]) -> anyhow::Result<Self> {
        let [red, green, blue] = rgb;
        let [wifi, broker, user] = status;
        Ok(Self {
            red: PinDriver::output(red)?,
            green: PinDriver::output(green)?,
            blue: PinDriver::output(blue)?,
            wifi: PinDriver::output(wifi)?,
            broker: PinDriver::output(broker)?,
            user: PinDriver::output(user)?,
            lines: Default::default(),
        })
    }
}

fn drive(pin: &mut LedPin, on: bool) {
    let result = if on { pin.set_high() } else { pin.set_low() };
    if let Err(err) = result {
        warn!("failed to drive LED pin: {err:?}");
    }
}

impl DisplaySink for LedPanel {
    fn show_line(&mut self, index: usize, text: &str) {
        if let Some(line) = self.lines.get_mut(index) {
            if line != text {
                info!("display[{index}]: {text}");
                *line = text.to_string();
            }
        }
    }

    fn clear(&mut self) {
        self.lines = Default::default();
    }

    fn set_indicator(&mut self, color: LedColor) {
        let (r, g, b) = color.rgb();
        drive(&mut self.red, r > 0);
        drive(&mut self.green, g > 0);
        drive(&mut self.blue, b > 0);
    }

    fn set_status_leds(&mut self, leds: StatusLeds) {
        drive(&mut self.wifi, leds.wifi);
        drive(&mut self.broker, leds.broker);
        drive(&mut self.user, leds.user);
    }
}

struct WifiLink {
    wifi: EspWifi<'static>,
}

impl Link for WifiLink {
    fn is_connected(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err:?}");
        }
    }

    fn begin(&mut self, ssid: &str, password: &str) {
        if let Err(err) = configure_wifi(&mut self.wifi, ssid, password) {
            warn!("wifi association failed to start: {err:#}");
        }
    }
}

fn configure_wifi(wifi: &mut EspWifi<'static>, ssid: &str, password: &str) -> anyhow::Result<()> {
    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: password
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    if !wifi.is_started()? {
        wifi.start()?;
    }
    wifi.connect()?;
    info!("wifi connecting to `{ssid}`");
    Ok(())
}

struct EspRestart;

impl Restart for EspRestart {
    fn restart(&self, reason: &str) {
        warn!("restarting: {reason}");
        thread::sleep(Duration::from_millis(100));
        unsafe { sys::esp_restart() };
    }
}

fn open_store() -> anyhow::Result<ConfigStore<PartitionFlash>> {
    let flash = PartitionFlash::find(CONFIG_PARTITION)?;
    let mut store = ConfigStore::new(flash, 0).context("config partition too small")?;
    store.set_defaults(DeviceConfig::default());
    match store.load() {
        Ok(_) => {}
        Err(StoreError::NotFound) => info!("no stored configuration; using defaults"),
        Err(err) => {
            warn!("stored configuration rejected ({err}); using defaults");
            store.reset_to_defaults();
        }
    }
    Ok(store)
}

/// UART0 console input. The IDF console driver reports an idle line as end of
/// input, which is mapped to `WouldBlock` so the reader keeps polling.
struct UartInput(io::Stdin);

impl Read for UartInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf)? {
            0 => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }
}

fn offer_setup(store: &mut ConfigStore<PartitionFlash>) -> anyhow::Result<()> {
    let mut console = ReaderConsole::spawn(UartInput(io::stdin()), false)
        .context("failed to open setup console")?;
    match run_setup(&mut console, &SystemClock, store) {
        Ok(true) => info!("setup finished"),
        Ok(false) => {}
        Err(err) => warn!("setup could not save configuration: {err}"),
    }
    Ok(())
}

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut store = open_store()?;
    offer_setup(&mut store)?;
    let config = store.get_config().clone();

    let mut link = WifiLink {
        wifi: EspWifi::new(modem, sys_loop, Some(nvs_partition))?,
    };
    link.begin(config.wifi_ssid.as_str(), config.wifi_password.as_str());

    let sensors = Dht11Sensors::new(pins.gpio16.downgrade())
        .context("failed to initialize DHT11")?;
    let panel = LedPanel::new(
        [
            pins.gpio25.downgrade_output(),
            pins.gpio26.downgrade_output(),
            pins.gpio27.downgrade_output(),
        ],
        [
            pins.gpio2.downgrade_output(),
            pins.gpio4.downgrade_output(),
            pins.gpio5.downgrade_output(),
        ],
    )
    .context("failed to initialize LEDs")?;

    let shared = Arc::new(SharedContext::new(config));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let restart: Arc<dyn Restart> = Arc::new(EspRestart);
    let running = Arc::new(AtomicBool::new(true));

    let mut names = NameCache::new();
    for (host, addr) in parse_host_list(option_env!("STATION_HOSTS").unwrap_or_default()) {
        if let Err(err) = names.insert(&host, addr) {
            warn!("skipping host `{host}`: {err}");
        }
    }

    let control = ControlServer::new(store, shared.clone(), clock.clone(), restart.clone());
    let control_running = running.clone();
    thread::Builder::new()
        .name("control".to_string())
        .stack_size(12 * 1024)
        .spawn(move || {
            let bind = TcpBind {
                addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, CONTROL_PORT)),
            };
            control.run(bind, &control_running);
        })
        .context("failed to spawn control worker")?;

    let mut station = Station::new(
        shared,
        clock.clone(),
        restart,
        MessageClient::new(TcpConnector, clock, names),
        link,
        sensors,
        panel,
        SupervisorConfig::default(),
    );

    init_watchdog(TASK_WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;
    info!("sensor station started");

    loop {
        feed_watchdog();
        station.tick();
        thread::sleep(Duration::from_millis(MAIN_LOOP_DELAY_MS));
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { sys::esp_task_wdt_init(&config) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
}
