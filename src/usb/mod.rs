//! ## USB layer
//!
//! Finding bricks on the bus and opening them. The per-device worker
//! (reader/writer threads, routing table, enumeration) lives in
//! [`worker`].
//!
//! Grounded on `init.rs`'s `open_device`/`get_endpoints` descriptor-walking
//! style, generalized from "any USBTMC device" filtering to the fixed
//! Tinkerforge vendor/product id and bulk endpoint addresses.

pub mod worker;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use crate::constants::usb::*;
use crate::error::{Error, Result};

/// (bus, address) uniquely identifies a physical USB device for as long as
/// it stays plugged in. Used by the hotplug controller to diff "what's
/// plugged in now" against "what we have a worker for".
pub type DeviceAddr = (u8, u8);

fn is_brick(device_desc: &rusb::DeviceDescriptor) -> bool {
    device_desc.vendor_id() == VENDOR_ID && device_desc.product_id() == PRODUCT_ID
}

/// Every brick currently visible on the bus, by (bus, address).
pub fn enumerate_bricks(context: &Context) -> Result<Vec<DeviceAddr>> {
    let devices = context.devices().map_err(Error::Usb)?;
    Ok(devices
        .iter()
        .filter_map(|device| {
            let desc = device.device_descriptor().ok()?;
            is_brick(&desc).then(|| (device.bus_number(), device.address()))
        })
        .collect())
}

/// Open the brick at `addr`, reset it, set its configuration, and claim its
/// interface. Returns the handle and the bulk IN/OUT endpoint addresses.
pub fn open_brick(context: &Context, addr: DeviceAddr) -> Result<(DeviceHandle<Context>, u8, u8)> {
    let devices = context.devices().map_err(Error::Usb)?;
    let device = devices
        .iter()
        .find(|d| (d.bus_number(), d.address()) == addr)
        .ok_or(Error::DeviceNotFound)?;

    let mut handle = device.open().map_err(Error::Usb)?;
    handle.reset().map_err(Error::Usb)?;
    let _ = handle.set_active_configuration(CONFIGURATION);
    handle
        .claim_interface(INTERFACE)
        .map_err(Error::Usb)?;

    let (bulk_in, bulk_out) = find_bulk_endpoints(&device)?;
    Ok((handle, bulk_in, bulk_out))
}

/// Walk the device's configuration/interface descriptors and confirm the
/// bulk IN/OUT endpoints brickd expects are actually present, returning
/// their addresses. Mirrors `init.rs::get_endpoints`, narrowed to the two
/// endpoints a brick always exposes on interface 0.
fn find_bulk_endpoints<T: UsbContext>(device: &Device<T>) -> Result<(u8, u8)> {
    let config_desc = device
        .active_config_descriptor()
        .map_err(Error::Usb)?;
    let interface = config_desc
        .interfaces()
        .find(|i| i.number() == INTERFACE)
        .ok_or(Error::EndpointNotFound)?;

    let mut bulk_in = None;
    let mut bulk_out = None;
    for interface_desc in interface.descriptors() {
        for endpoint in interface_desc.endpoint_descriptors() {
            if endpoint.transfer_type() != TransferType::Bulk {
                continue;
            }
            match endpoint.direction() {
                Direction::In if endpoint.address() == ENDPOINT_IN => bulk_in = Some(endpoint.address()),
                Direction::Out if endpoint.address() == ENDPOINT_OUT => bulk_out = Some(endpoint.address()),
                _ => {}
            }
        }
    }

    match (bulk_in, bulk_out) {
        (Some(bulk_in), Some(bulk_out)) => Ok((bulk_in, bulk_out)),
        _ => Err(Error::EndpointNotFound),
    }
}
