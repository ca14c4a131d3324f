use rusb::Error as UsbError;
use thiserror::Error;

/// Everything that can go wrong between the USB dongle and a profile.
///
/// `Protocol` and `PairingMismatch` are fatal to the channel they occur on;
/// the remaining variants are dongle-level and propagate to the embedding
/// server.
#[derive(Error, Debug)]
pub enum AntError {
    #[error("no ANT+ USB stick found")]
    DeviceNotFound,
    #[error("USB transport error: {0}")]
    Transport(#[from] UsbError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid frame: {0}")]
    Framing(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("paired device does not match the configured channel id")]
    PairingMismatch,
    #[error("no free channel slot on the dongle")]
    ResourceExhausted,
    #[error("timed out waiting for the dongle")]
    Timeout,
}
