use std::{
    fs,
    io::IsTerminal,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use tracing::{info, warn};

use station_common::{
    resolve::parse_host_list, run_setup, store::StoreError, Axes, Clock, ConfigStore,
    ControlServer, DeviceConfig, DisplaySink, LedColor, Link, MessageClient, NameCache, RamFlash,
    ReaderConsole, Restart, SensorReadings, SensorSource, SharedContext, Station, StatusLeds, SupervisorConfig,
    SystemClock, TcpBind, TcpConnector,
};

const FLASH_IMAGE: &str = "config.bin";
const LINK_DOWN_MARKER: &str = "link-down";
const RESTART_EXIT_CODE: i32 = 3;

/// RAM flash mirrored to a file after every erase or program.
struct FileFlash {
    path: PathBuf,
    inner: RamFlash,
}

impl FileFlash {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let inner = match fs::read(&path) {
            Ok(image) => RamFlash::from_image(image),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RamFlash::new(1),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self { path, inner })
    }

    fn persist(&self) -> Result<(), NorFlashErrorKind> {
        fs::write(&self.path, self.inner.image()).map_err(|err| {
            warn!("failed to write flash image {}: {err}", self.path.display());
            NorFlashErrorKind::Other
        })
    }
}

impl ErrorType for FileFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for FileFlash {
    const READ_SIZE: usize = RamFlash::READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.inner.read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl NorFlash for FileFlash {
    const WRITE_SIZE: usize = RamFlash::WRITE_SIZE;
    const ERASE_SIZE: usize = RamFlash::ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.inner.erase(from, to)?;
        self.persist()
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.inner.write(offset, bytes)?;
        self.persist()
    }
}

/// Slowly drifting readings so the panel and broker see changing values.
#[derive(Default)]
struct SimulatedSensors {
    tick: u32,
}

impl SensorSource for SimulatedSensors {
    fn read(&mut self) -> Option<SensorReadings> {
        self.tick = self.tick.wrapping_add(1);
        let step = (self.tick % 8) as f32;
        Some(SensorReadings {
            temperature_c: 21.0 + step * 0.1,
            humidity: 42.0 + (self.tick % 6) as f32 * 0.5,
            pressure_hpa: 1012.0 + step * 0.2,
            accel: Axes::new(0.0, 0.0, 1.0),
            gyro: Axes::default(),
            mag: Axes::new(0.2, -0.1, 0.4),
        })
    }
}

#[derive(Default)]
struct ConsoleDisplay {
    lines: [String; 4],
    indicator: LedColor,
    leds: StatusLeds,
}

impl DisplaySink for ConsoleDisplay {
    fn show_line(&mut self, index: usize, text: &str) {
        if let Some(line) = self.lines.get_mut(index) {
            if line != text {
                info!(line = index, "display: {text}");
                *line = text.to_string();
            }
        }
    }

    fn clear(&mut self) {
        info!("display cleared");
        self.lines = Default::default();
    }

    fn set_indicator(&mut self, color: LedColor) {
        if self.indicator != color {
            let (r, g, b) = color.rgb();
            info!("indicator {} ({r},{g},{b})", color.as_str());
            self.indicator = color;
        }
    }

    fn set_status_leds(&mut self, leds: StatusLeds) {
        if self.leds != leds {
            info!(wifi = leds.wifi, broker = leds.broker, user = leds.user, "status leds");
            self.leds = leds;
        }
    }
}

/// Reports the link down while `<data_dir>/link-down` exists.
struct HostLink {
    marker: PathBuf,
}

impl Link for HostLink {
    fn is_connected(&mut self) -> bool {
        !self.marker.exists()
    }

    fn disconnect(&mut self) {
        info!("link disconnect requested");
    }

    fn begin(&mut self, ssid: &str, _password: &str) {
        info!("link association requested for `{ssid}`");
    }
}

/// Exits so a service manager can relaunch the process.
struct HostRestart;

impl Restart for HostRestart {
    fn restart(&self, reason: &str) {
        warn!("restarting: {reason}");
        std::process::exit(RESTART_EXIT_CODE);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse::<T>().ok())
}

fn first_boot_defaults() -> DeviceConfig {
    let mut defaults = DeviceConfig::default();
    if let Ok(host) = std::env::var("MQTT_HOST") {
        defaults.broker_host.set(&host);
    }
    if let Some(port) = env_parse::<u32>("MQTT_PORT") {
        defaults.broker_port = port;
    }
    if let Ok(device_id) = std::env::var("DEVICE_ID") {
        defaults.device_id.set(&device_id);
    }
    defaults.sanitize();
    defaults
}

fn open_store(data_dir: &Path) -> anyhow::Result<ConfigStore<FileFlash>> {
    let flash = FileFlash::open(data_dir.join(FLASH_IMAGE))?;
    let mut store = ConfigStore::new(flash, 0).context("flash image cannot hold the config record")?;
    store.set_defaults(first_boot_defaults());

    match store.load() {
        Ok(_) => {}
        Err(StoreError::NotFound) => {
            info!("no stored configuration; writing defaults");
            let defaults = store.get_config().clone();
            if let Err(err) = store.save(&defaults) {
                warn!("failed to persist defaults: {err}");
            }
        }
        Err(err) => {
            warn!("stored configuration rejected ({err}); using defaults");
            store.reset_to_defaults();
        }
    }
    Ok(store)
}

/// Serial-style setup on an interactive stdin. `STATION_SKIP_SETUP` bypasses it.
fn offer_setup(store: &mut ConfigStore<FileFlash>) -> anyhow::Result<()> {
    if !std::io::stdin().is_terminal() || std::env::var_os("STATION_SKIP_SETUP").is_some() {
        return Ok(());
    }
    let mut console =
        ReaderConsole::spawn(std::io::stdin(), true).context("failed to open setup console")?;
    match run_setup(&mut console, &SystemClock, store) {
        Ok(true) => info!("setup finished"),
        Ok(false) => {}
        Err(err) => warn!("setup could not save configuration: {err}"),
    }
    Ok(())
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = PathBuf::from(
        std::env::var("STATION_DATA_DIR").unwrap_or_else(|_| "./.station".to_string()),
    );
    let http_port = env_parse::<u16>("STATION_HTTP_PORT").unwrap_or(8080);
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let mut store = open_store(&data_dir)?;
    let store = tokio::task::spawn_blocking(move || offer_setup(&mut store).map(|()| store))
        .await
        .context("setup console panicked")??;
    let shared = Arc::new(SharedContext::new(store.get_config().clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let restart: Arc<dyn Restart> = Arc::new(HostRestart);
    let running = Arc::new(AtomicBool::new(true));

    let mut names = NameCache::new();
    for (host, addr) in parse_host_list(&std::env::var("STATION_HOSTS").unwrap_or_default()) {
        if let Err(err) = names.insert(&host, addr) {
            warn!("skipping host `{host}`: {err}");
        }
    }

    let control = ControlServer::new(store, shared.clone(), clock.clone(), restart.clone());
    let bind = TcpBind {
        addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, http_port)),
    };
    let control_running = running.clone();
    let control_task =
        tokio::task::spawn_blocking(move || control.run(bind, &control_running));

    let mut station = Station::new(
        shared,
        clock.clone(),
        restart,
        MessageClient::new(TcpConnector, clock, names),
        HostLink {
            marker: data_dir.join(LINK_DOWN_MARKER),
        },
        SimulatedSensors::default(),
        ConsoleDisplay::default(),
        SupervisorConfig::default(),
    );
    let station_running = running.clone();
    let station_task = tokio::task::spawn_blocking(move || station.run(&station_running));

    info!("sensor station started (control panel on port {http_port})");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    running.store(false, Ordering::Release);

    station_task.await.context("station loop panicked")?;
    control_task.await.context("control worker panicked")?;
    Ok(())
}
