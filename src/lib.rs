//! CANopen (CiA 402) control stack for a two-wheel differential-drive robot.

mod error;
pub use error::{Error, Result};

pub mod frame;
pub mod id;

pub mod bus;
pub use bus::{CanInterface, FrameBus, FrameTap, SubscriptionId};

pub mod sdo_client;
pub use sdo_client::SdoClient;

pub mod pdo_store;
pub use pdo_store::{NodeTelemetry, PdoStore, TelemetryEvent};

pub mod cia402;
pub use cia402::{Cia402Device, Cia402State, OperationMode};

pub mod drive;
pub use drive::{ControllerSnapshot, DifferentialDrive, DriveParams, DriveSetpoint, Wheel};

pub mod config;
pub use config::Config;

pub mod robot;
pub use robot::Robot;

mod socketcan;
pub use self::socketcan::SocketCanInterface;

#[cfg(test)]
mod testing;
