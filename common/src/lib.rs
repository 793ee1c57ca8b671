pub mod actuator;
pub mod climate;
pub mod config;
pub mod control;
pub mod error;
pub mod fields;
pub mod network;
pub mod sensor;
pub mod telemetry;
pub mod ticks;
pub mod types;

pub use actuator::Actuator;
pub use climate::{fake_clim_temperature, TempRange};
pub use config::{
    ControlConfig, HardwareConfig, NetworkConfig, RuntimeConfig, TelemetryConfig,
    ITERATION_BUDGET_MS,
};
pub use control::{ControlLoop, CycleReport, LoopState};
pub use error::{
    ConfigError, ConnectionFailure, FetchError, NodeError, PublishError, SensorError,
    TransportError,
};
pub use fields::*;
pub use network::NetworkLink;
pub use sensor::Sensor;
pub use telemetry::{HttpResponse, HttpTransport, Telemetry, ThingSpeakClient};
pub use ticks::{Cadence, Clock, MonotonicClock, Ticks};
pub use types::{
    Ack, ActuatorState, ChannelUpdate, Field, FieldValue, LinkInfo, LoopVariant, Reading,
};
