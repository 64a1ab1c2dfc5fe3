//! brickd bridges Tinkerforge brick stacks connected over USB to a plain
//! TCP socket, translating each physical stack's own local stack-id space
//! into one shared, daemon-global id space so multiple clients can talk to
//! multiple stacks through a single port.

pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod hotplug;
pub mod reassembler;
pub mod registry;
pub mod routing;
pub mod server;
pub mod supervisor;
pub mod usb;

pub use error::{Error, Result};
