pub mod config;
pub mod control;
pub mod device;
pub mod flash;
pub mod http;
pub mod mqtt;
pub mod net;
pub mod pages;
pub mod resolve;
pub mod setup;
pub mod shared;
pub mod station;
pub mod store;
pub mod supervisor;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{DeviceConfig, FixedStr};
pub use control::ControlServer;
pub use device::{DisplaySink, Link, Restart, SensorSource};
pub use flash::RamFlash;
pub use mqtt::{MessageClient, MqttError};
pub use net::{Clock, Connector, SystemClock, TcpBind, TcpConnector};
pub use resolve::{NameCache, ResolveError};
pub use setup::{run_setup, ReaderConsole, SetupConsole};
pub use shared::{ActuatorState, SharedContext};
pub use station::Station;
pub use store::{ConfigStore, StoreError};
pub use supervisor::{ConnectivitySupervisor, SupervisorAction, SupervisorConfig};
pub use types::{Axes, LedColor, LinkState, SensorReadings, StatusLeds, TelemetryPayload};
