//! ## Constants
//!
//! Protocol, USB, and queue-sizing constants used throughout the daemon.
//!

#[allow(unused)]
pub mod usb {
    /// Vendor id of a brick.
    pub const VENDOR_ID: u16 = 0x16D0;
    /// Product id of a brick.
    pub const PRODUCT_ID: u16 = 0x063D;

    /// The configuration every brick is opened under.
    pub const CONFIGURATION: u8 = 1;
    /// The interface every brick is claimed on.
    pub const INTERFACE: u8 = 0;
    /// Bulk IN endpoint address.
    pub const ENDPOINT_IN: u8 = 0x84;
    /// Bulk OUT endpoint address.
    pub const ENDPOINT_OUT: u8 = 0x05;

    /// Max packet size on either bulk endpoint.
    pub const ENDPOINT_SIZE: usize = 64;
    /// Size of a single bulk-IN read buffer.
    pub const READ_BUFFER_SIZE: usize = 4096;

    /// Number of reader threads kept alive per device.
    pub const NUM_READ_TRANSFER: usize = 5;
    /// Number of bulk-OUT transfers allowed in flight per device.
    pub const NUM_WRITE_TRANSFER: usize = 5;

    /// Per-transfer timeout. Bounds how long a reader/writer thread can be
    /// blocked inside libusb before it wakes up and rechecks the worker's
    /// stop flag.
    pub const TRANSFER_TIMEOUT_MS: u64 = 1000;
}

#[allow(unused)]
pub mod frame {
    /// Size of the frame header (stack id, type, length).
    pub const HEADER_SIZE: usize = 4;
    /// Minimum legal frame length (header only).
    pub const MIN_LENGTH: usize = HEADER_SIZE;
    /// Maximum legal frame length (one USB transfer).
    pub const MAX_LENGTH: usize = super::usb::ENDPOINT_SIZE;

    /// Broadcast / enumeration stack id.
    pub const STACK_ID_BROADCAST: u8 = 0;

    /// Host -> stack enumeration request.
    pub const TYPE_ENUMERATE: u8 = 254;
    /// Stack -> host enumeration callback (also used, with the denumerate
    /// flag cleared, for the synthetic "device gone" broadcast).
    pub const TYPE_ENUMERATE_CALLBACK: u8 = 253;
    /// Get-stack-id request/response.
    pub const TYPE_GET_STACK_ID: u8 = 255;

    /// Length of an enumeration-callback / denumerate frame.
    pub const ENUMERATE_CALLBACK_LENGTH: usize = 54;
    /// Offset of the UID field in an enumeration-callback frame.
    pub const ENUMERATE_UID_OFFSET: usize = 4;
    /// Offset of the 40-byte name field in an enumeration-callback frame.
    pub const ENUMERATE_NAME_OFFSET: usize = 12;
    /// Length in bytes of the name field.
    pub const ENUMERATE_NAME_LENGTH: usize = 40;
    /// Offset of the stack-id byte in an enumeration-callback frame.
    pub const ENUMERATE_STACK_ID_OFFSET: usize = 52;
    /// Offset of the boolean "this is a live enumeration, not a denumerate" flag.
    pub const ENUMERATE_IS_PRESENT_OFFSET: usize = 53;

    /// Offset of the returned stack id in a get-stack-id reply.
    pub const GET_STACK_ID_REPLY_OFFSET: usize = 55;

    /// Maximum pending-response registrations held per `(device, request_key)`.
    pub const MAX_PENDING_PER_KEY: usize = 25;
}
