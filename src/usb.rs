use std::time::Duration;

pub use rusb::{Context, UsbContext};
use rusb::{ConfigDescriptor, DeviceHandle, Direction, Error, TransferType};

use super::{error::AntError, Result};

// ANT+ USB stick vendor/product pairs. The first device that matches wins.
const ANT_STICK_IDS: [(u16, u16); 2] = [(0x0FCF, 0x1008), (0x0FCF, 0x1009)];

const USB_ANT_CONFIGURATION: u8 = 1;
const USB_ANT_INTERFACE: u8 = 0;

/// Byte pipe to the dongle. The dongle controller is written against this
/// trait so the protocol stack can be exercised without hardware.
pub trait Transport {
    /// Read whatever the dongle has ready into `buf`, returning the number
    /// of bytes transferred. A quiet dongle yields `rusb::Error::Timeout`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write `data` in full or fail.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;
}

/// The bulk IN/OUT pipes of a physical ANT+ stick.
pub struct UsbTransport<T: UsbContext> {
    handle: DeviceHandle<T>,
    endpoint_in: u8,
    endpoint_out: u8,
}

impl<T: UsbContext> UsbTransport<T> {
    /// Find the first ANT+ stick on the bus and prepare it for bulk I/O:
    /// claim interface 0, force configuration 1, reset the device, and
    /// clear any halted endpoints left over from a previous user.
    pub fn open(ctx: &T) -> Result<UsbTransport<T>> {
        for device in ctx.devices()?.iter() {
            let desc = device.device_descriptor()?;
            if !ANT_STICK_IDS
                .iter()
                .any(|&(vid, pid)| desc.vendor_id() == vid && desc.product_id() == pid)
            {
                continue;
            }

            let mut handle = device.open()?;
            // Not needed on Windows, harmless there, required on Linux.
            let _ = handle.set_auto_detach_kernel_driver(true);

            handle.claim_interface(USB_ANT_INTERFACE)?;
            if handle.active_configuration()? != USB_ANT_CONFIGURATION {
                // The configuration cannot be changed while an interface is
                // claimed.
                handle.release_interface(USB_ANT_INTERFACE)?;
                handle.set_active_configuration(USB_ANT_CONFIGURATION)?;
                handle.claim_interface(USB_ANT_INTERFACE)?;
            }
            handle.reset()?;

            let config = device.active_config_descriptor()?;
            let (endpoint_in, endpoint_out) = find_bulk_endpoints(&config)?;
            handle.clear_halt(endpoint_in)?;
            handle.clear_halt(endpoint_out)?;

            return Ok(UsbTransport {
                handle,
                endpoint_in,
                endpoint_out,
            });
        }
        Err(AntError::DeviceNotFound)
    }
}

/// An ANT stick exposes exactly one interface with one alternate setting
/// holding one bulk endpoint in each direction.
fn find_bulk_endpoints(config: &ConfigDescriptor) -> Result<(u8, u8)> {
    let mut endpoint_in = None;
    let mut endpoint_out = None;

    if config.num_interfaces() != 1 {
        return Err(AntError::Protocol(format!(
            "expected 1 USB interface, found {}",
            config.num_interfaces()
        )));
    }
    for interface in config.interfaces() {
        let descriptors: Vec<_> = interface.descriptors().collect();
        if descriptors.len() != 1 {
            return Err(AntError::Protocol(format!(
                "expected 1 alternate setting, found {}",
                descriptors.len()
            )));
        }
        for endpoint in descriptors[0].endpoint_descriptors() {
            if endpoint.transfer_type() != TransferType::Bulk {
                continue;
            }
            match endpoint.direction() {
                Direction::In => endpoint_in = Some(endpoint.address()),
                Direction::Out => endpoint_out = Some(endpoint.address()),
            }
        }
    }

    match (endpoint_in, endpoint_out) {
        (Some(i), Some(o)) => Ok((i, o)),
        _ => Err(AntError::Protocol(
            "ANT stick is missing a bulk endpoint".into(),
        )),
    }
}

impl<T: UsbContext> Transport for UsbTransport<T> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_bulk(self.endpoint_in, buf, timeout)
            .map_err(AntError::Transport)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        match self.handle.write_bulk(self.endpoint_out, data, timeout) {
            Ok(len) if len == data.len() => Ok(()),
            Ok(len) => Err(AntError::Protocol(format!(
                "short USB write: {} of {} bytes",
                len,
                data.len()
            ))),
            Err(Error::Pipe) => {
                // A stalled endpoint stays stalled until cleared; do that
                // now so the next attempt has a chance.
                let _ = self.handle.clear_halt(self.endpoint_out);
                Err(AntError::Transport(Error::Pipe))
            }
            Err(e) => Err(AntError::Transport(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::{AntError, Result, Transport};
    use crate::message::{Message, ReadBuffer};

    /// Scripted transport: reads are served from a queue of byte chunks,
    /// writes are recorded for inspection.
    pub(crate) struct MockTransport {
        reads: VecDeque<Vec<u8>>,
        pub writes: Vec<Vec<u8>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                reads: VecDeque::new(),
                writes: Vec::new(),
            }
        }

        /// Queue an encoded message as the next read completion.
        pub fn push_message(&mut self, mesg: &Message) {
            self.reads.push_back(mesg.encode());
        }

        pub fn push_bytes(&mut self, bytes: &[u8]) {
            self.reads.push_back(bytes.to_vec());
        }

        /// Decode every recorded write back into messages.
        pub fn decoded_writes(&self) -> Vec<Message> {
            let mut buffer = ReadBuffer::new();
            let mut out = Vec::new();
            for write in &self.writes {
                buffer.extend(write);
            }
            while let Ok(Some(mesg)) = buffer.next_message() {
                out.push(mesg);
            }
            out
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            match self.reads.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(AntError::Transport(rusb::Error::Timeout)),
            }
        }

        fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
            self.writes.push(data.to_vec());
            Ok(())
        }
    }
}
