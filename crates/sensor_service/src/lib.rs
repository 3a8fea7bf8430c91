//! # Sensor Service
//!
//! The broker core: who is subscribed to what, at which rate the hardware
//! runs, and where each event goes.
//!
//! ## Components
//! - `ClientRegistry` - subscriptions, channels and client identity
//! - `RateArbitrator` - merges per-client rates and programs the hardware
//! - `FlushCoordinator` - attributes flush completions in request order
//! - `SuspendPolicy` - freezes and restores a process's sensors
//! - `EventDispatcher` - fans hardware events out to subscriber channels
//! - `SensorService` - the control surface tying them together
//!
//! ## Lock order
//! suspend snapshots -> per-sensor op lock -> registry -> active table -> flush queues

mod client_info;
mod dispatcher;
mod error;
mod flush_info;
mod sensor_manager;
mod service;
mod suspend_policy;

pub use client_info::{AppThreadInfo, ClientCleanup, ClientRegistry, Removed, SensorBasicInfo};
pub use dispatcher::EventDispatcher;
pub use error::{BulkOutcome, Result, ServiceError};
pub use flush_info::{FlushCoordinator, FlushQueueEntry};
pub use sensor_manager::{ActiveSensorState, DisableOutcome, EnableOutcome, RateArbitrator};
pub use service::{CallerInfo, SensorService};
pub use suspend_policy::{SuspendPolicy, SuspendSnapshot};
