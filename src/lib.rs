//! # Crate to interface with Parrot minidrones and Bebop drones
//!
//! This crate implements the control protocol of the Parrot Mambo, Swing,
//! Bebop and Bebop 2 drones. It sends piloting and setting commands and
//! decodes the sensor notifications of the drone.
//!
//! Two transports are supported:
//! - Wi-Fi, used by the Bebop drones and by the Mambo with its FPV camera.
//!   Frames travel over UDP after a JSON handshake over TCP.
//! - BLE, used by the Mambo and the Swing. Frames are written to and
//!   notified from GATT characteristics.
//!
//! # Protocol architecture
//!
//! Every command is identified by a numeric triple (project, class,
//! command) found by name in a static schema ([`commands`]). The same
//! schema describes the layout of the sensor notifications ([`resolver`]),
//! which the [`codec`] decodes into named fields.
//!
//! Both transports multiplex their frames on logical [`channels`], each with
//! its own 8 bits sequence counter. Commands sent on the acknowledged
//! channel are resent until the drone acknowledges their sequence number
//! or the retry budget is spent. A background task per connection answers
//! keep-alives, acknowledges drone data and feeds the [`state`].
//!
//! The high level entry point is [`Drone`]. Service discovery (mDNS) and the
//! GATT stack are left to the application, through the
//! [`ServiceDiscovery`](discovery::ServiceDiscovery) and
//! [`GattLink`](link::ble::GattLink) traits.
//!
//! See the demos in the repository for how to use this crate.

#![deny(missing_docs)]

pub mod channels;
pub mod codec;
pub mod commands;
pub mod config;
pub mod discovery;
mod drone;
mod error;
pub mod link;
pub mod resolver;
pub mod schema;
pub mod state;

pub use codec::Value;
pub use config::LinkConfig;
pub use drone::{Drone, PCMD_INTERVAL};
pub use error::{Error, Result};
pub use link::wifi::Airframe;
pub use schema::DroneFamily;
pub use state::SensorState;
