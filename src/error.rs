//! ## Errors
//!
//! The errors used throughout the crate.
//!

#[allow(unused)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no brick device found matching vendor/product id")]
    DeviceNotFound,
    #[error("libusb operation failed: {0}")]
    Usb(#[source] rusb::Error),
    #[error("frame too short or too long: {0} bytes")]
    FrameLength(usize),
    #[error("declared frame length {declared} does not match {observed} observed bytes")]
    FrameLengthMismatch { declared: usize, observed: usize },
    #[error("no unused global stack id available")]
    RoutingTableExhausted,
    #[error("pending-response queue for this request key is full")]
    PendingResponseOverflow,
    #[error("pidfile {0} is already locked by another instance")]
    PidfileLocked(std::path::PathBuf),
    #[error("bulk endpoint descriptor not found on interface 0")]
    EndpointNotFound,
    #[error("failed to bind TCP listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
