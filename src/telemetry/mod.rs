//! Signal samplers (C1-C4) and their fan-out bus.

pub mod battery;
pub mod bus;
pub mod percentile;
pub mod resource;
pub mod thermal;

pub use battery::{BatterySampler, BatterySource};
pub use bus::{TelemetryBus, TelemetryEvent};
pub use percentile::PercentileTracker;
pub use resource::ResourceSampler;
pub use thermal::{ThermalLevel, ThermalSampler, ThermalSource};
