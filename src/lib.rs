#![allow(dead_code)]
//! antbridge connects ANT+ fitness sensors to TCP clients through a USB
//! dongle. The library owns the whole path: finding and resetting the
//! stick, framing the ANT serial protocol over the bulk endpoints,
//! multiplexing channels, pairing with a heart rate monitor and an FE-C
//! trainer, and serving their readings over a line-oriented socket.
//!
//! Everything runs on one thread, driven cooperatively. A minimal host
//! creates the USB context and transport, initializes the dongle, and
//! then ticks the server forever:
//!
//! let ctx = antbridge::Context::new()?;
//! let transport = antbridge::UsbTransport::open(&ctx)?;
//! let mut ant = antbridge::Ant::init(transport)?;
//! ant.set_network_key(&antbridge::ANT_PLUS_NETWORK_KEY)?;
//! let mut server = antbridge::TelemetryServer::new(ant, antbridge::DEFAULT_PORT)?;
//! loop { server.tick()?; }
//!
//! Clients connecting to the server receive one TELEMETRY line per tick
//! and can steer the trainer with SET-SLOPE commands.

pub mod ant;
pub mod channel;
pub mod device;
mod error;
pub mod message;
pub mod server;
mod usb;

pub type Result<T> = std::result::Result<T, error::AntError>;

pub use ant::{Ant, ANT_PLUS_NETWORK_KEY};
pub use channel::{ChannelConfig, ChannelId, ChannelState};
pub use error::AntError;
pub use server::{TelemetryServer, DEFAULT_PORT};
pub use usb::{Context, Transport, UsbContext, UsbTransport};
