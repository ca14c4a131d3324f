/// The dongle controller. `Ant` owns the USB transport and the channel
/// slots, brings the stick up (reset, identity query, network key), and
/// multiplexes the inbound frame stream onto the channels. The host drives
/// it by calling `tick()` in a loop; there is no background thread.
use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelConfig, ChannelState};
use crate::device::Profile;
use crate::message::{self, bytes_to_u32, Message, ReadBuffer};
use crate::usb::Transport;
use crate::{error::AntError, Result};

/// The public ANT+ network key, installed into network slot 0.
pub const ANT_PLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

const WRITE_TIMEOUT: Duration = Duration::from_millis(2000);
const READ_TIMEOUT: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 128;
/// Short reads polled per synchronous response wait.
const READ_RETRIES: usize = 100;
/// Frames skipped past while waiting for a configuration response.
const RESPONSE_RETRIES: usize = 50;
/// Frames scanned for the startup message after a reset.
const STARTUP_RETRIES: usize = 50;
/// Bound on frames parked during synchronous round trips; the oldest is
/// dropped beyond this.
const MAX_DELAYED_MESSAGES: usize = 64;

/// The byte pipe plus framing state shared by the controller and its
/// channels. Channels borrow it for the duration of one operation, so
/// there is no back-reference from channel to controller.
pub(crate) struct Link<T: Transport> {
    transport: T,
    buffer: ReadBuffer,
    delayed: VecDeque<Message>,
    delayed_dropped: u64,
    framing_errors: u64,
}

impl<T: Transport> Link<T> {
    fn new(transport: T) -> Self {
        Link {
            transport,
            buffer: ReadBuffer::new(),
            delayed: VecDeque::new(),
            delayed_dropped: 0,
            framing_errors: 0,
        }
    }

    pub(crate) fn write_message(&mut self, mesg: &Message) -> Result<()> {
        trace!("writing message {:#04x} {:02x?}", mesg.id, mesg.data);
        self.transport.write(&mesg.encode(), WRITE_TIMEOUT)
    }

    /// Next frame already sitting in the decode buffer. Frames failing
    /// their checksum are counted and skipped.
    fn next_buffered(&mut self) -> Option<Message> {
        loop {
            match self.buffer.next_message() {
                Ok(mesg) => return mesg,
                Err(e) => {
                    self.framing_errors += 1;
                    warn!("dropping frame: {}", e);
                }
            }
        }
    }

    /// One non-blocking poll of the dongle: a buffered frame if one is
    /// complete, otherwise a single short read.
    fn try_next_message(&mut self) -> Result<Option<Message>> {
        if let Some(mesg) = self.next_buffered() {
            return Ok(Some(mesg));
        }
        let mut chunk = [0u8; READ_CHUNK];
        match self.transport.read(&mut chunk, READ_TIMEOUT) {
            Ok(len) => self.buffer.extend(&chunk[..len]),
            Err(AntError::Transport(rusb::Error::Timeout)) => return Ok(None),
            Err(e) => return Err(e),
        }
        Ok(self.next_buffered())
    }

    /// Blocking read, bounded by `READ_RETRIES` short polls.
    fn next_message(&mut self) -> Result<Message> {
        for _ in 0..READ_RETRIES {
            if let Some(mesg) = self.try_next_message()? {
                return Ok(mesg);
            }
        }
        Err(AntError::Timeout)
    }

    /// Data frames that must not be consumed by a synchronous round trip:
    /// broadcast and burst data, and channel responses that carry events
    /// or acknowledged-data replies rather than configuration status.
    fn set_aside(mesg: &Message) -> bool {
        mesg.id == message::MESG_BROADCAST_DATA_ID
            || mesg.id == message::MESG_BURST_DATA_ID
            || (mesg.id == message::MESG_RESPONSE_EVENT_ID
                && mesg.data.len() >= 2
                && (mesg.data[1] == message::MESG_EVENT_ID
                    || mesg.data[1] == message::MESG_ACKNOWLEDGE_DATA_ID
                    || mesg.data[1] == message::MESG_BURST_DATA_ID))
    }

    /// Read the next message intended for dongle or channel management,
    /// parking asynchronous data frames for later dispatch by `tick`.
    fn read_internal(&mut self) -> Result<Message> {
        for _ in 0..RESPONSE_RETRIES {
            let mesg = self.next_message()?;
            if Self::set_aside(&mesg) {
                if self.delayed.len() == MAX_DELAYED_MESSAGES {
                    self.delayed.pop_front();
                    self.delayed_dropped += 1;
                    warn!("delayed frame queue full, dropping the oldest frame");
                }
                self.delayed.push_back(mesg);
            } else {
                return Ok(mesg);
            }
        }
        Err(AntError::Timeout)
    }

    /// Write a configuration message and confirm the dongle accepted it
    /// with a matching zero-status channel response.
    pub(crate) fn request(&mut self, mesg: &Message, channel: u8, command: u8) -> Result<()> {
        self.write_message(mesg)?;
        let response = self.read_internal()?;
        expect_channel_response(&response, channel, command)
    }
}

fn expect_channel_response(mesg: &Message, channel: u8, command: u8) -> Result<()> {
    if mesg.id == message::MESG_RESPONSE_EVENT_ID
        && mesg.data.len() >= 3
        && mesg.data[0] == channel
        && mesg.data[1] == command
        && mesg.data[2] == 0
    {
        Ok(())
    } else {
        Err(AntError::Protocol(format!(
            "expected status 0 for command {:#04x} on channel {}, got message {:#04x} {:02x?}",
            command, channel, mesg.id, mesg.data
        )))
    }
}

pub struct Ant<T: Transport> {
    link: Link<T>,
    serial_number: u32,
    version: String,
    max_channels: u8,
    max_networks: u8,
    network: Option<u8>,
    channels: Vec<Option<Channel>>,
}

impl<T: Transport> Ant<T> {
    /// Reset the dongle and query its identity. Completes before any
    /// channel can be opened; a dongle that fails here is unusable.
    pub fn init(transport: T) -> Result<Ant<T>> {
        let mut link = Link::new(transport);
        Self::reset(&mut link)?;

        link.write_message(&message::request_message(0, message::MESG_SERIAL_NUMBER_ID))?;
        let mesg = link.read_internal()?;
        if mesg.id != message::MESG_SERIAL_NUMBER_ID || mesg.data.len() < 4 {
            return Err(AntError::Protocol(format!(
                "unexpected reply {:#04x} to the serial number request",
                mesg.id
            )));
        }
        let serial_number = bytes_to_u32(&mesg.data[..4]);

        link.write_message(&message::request_message(0, message::MESG_VERSION_ID))?;
        let mesg = link.read_internal()?;
        if mesg.id != message::MESG_VERSION_ID {
            return Err(AntError::Protocol(format!(
                "unexpected reply {:#04x} to the version request",
                mesg.id
            )));
        }
        let version = mesg
            .data
            .split(|&b| b == 0)
            .next()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();

        link.write_message(&message::request_message(0, message::MESG_CAPABILITIES_ID))?;
        let mesg = link.read_internal()?;
        if mesg.id != message::MESG_CAPABILITIES_ID || mesg.data.len() < 2 {
            return Err(AntError::Protocol(format!(
                "unexpected reply {:#04x} to the capabilities request",
                mesg.id
            )));
        }
        let max_channels = mesg.data[0];
        let max_networks = mesg.data[1];

        info!(
            "ANT+ stick serial {:#010x}, version {}, max {} channels, max {} networks",
            serial_number, version, max_channels, max_networks
        );

        Ok(Ant {
            link,
            serial_number,
            version,
            max_channels,
            max_networks,
            network: None,
            channels: (0..max_channels).map(|_| None).collect(),
        })
    }

    /// Reset the stick and wait for its startup message. Some sticks
    /// occasionally omit the startup message yet work fine afterwards, so
    /// its absence is tolerated.
    fn reset(link: &mut Link<T>) -> Result<()> {
        link.write_message(&message::reset())?;
        for _ in 0..STARTUP_RETRIES {
            match link.read_internal() {
                Ok(mesg) if mesg.id == message::MESG_STARTUP_MESG_ID => break,
                Ok(_) => continue,
                Err(AntError::Timeout) => {
                    debug!("no startup message after reset, continuing anyway");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        // Discard anything queued by the previous user of the stick.
        link.delayed.clear();
        Ok(())
    }

    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn max_channels(&self) -> u8 {
        self.max_channels
    }

    pub fn max_networks(&self) -> u8 {
        self.max_networks
    }

    /// Checksum failures seen on the inbound stream so far.
    pub fn framing_errors(&self) -> u64 {
        self.link.framing_errors
    }

    /// Install the 8-byte network key. Only one network is used, so the
    /// key always goes into network slot 0.
    pub fn set_network_key(&mut self, key: &[u8; 8]) -> Result<()> {
        let network = 0;
        self.network = None;
        self.link.request(
            &message::set_network_key(network, key),
            network,
            message::MESG_NETWORK_KEY_ID,
        )?;
        self.network = Some(network);
        Ok(())
    }

    fn next_channel_number(&self) -> Result<u8> {
        (0..self.max_channels)
            .find(|&n| self.channels[n as usize].is_none())
            .ok_or(AntError::ResourceExhausted)
    }

    /// Assign, configure, and open a channel on the lowest free slot.
    /// Returns the slot number used to address the channel afterwards.
    pub fn open_channel(&mut self, config: ChannelConfig, profile: Profile) -> Result<u8> {
        let network = self
            .network
            .ok_or_else(|| AntError::Protocol("network key not set".into()))?;
        let number = self.next_channel_number()?;
        let channel = Channel::configure(&mut self.link, number, network, config, profile)?;
        self.channels[number as usize] = Some(channel);
        Ok(number)
    }

    pub fn channel(&self, number: u8) -> Option<&Channel> {
        self.channels.get(number as usize)?.as_ref()
    }

    pub fn channel_mut(&mut self, number: u8) -> Option<&mut Channel> {
        self.channels.get_mut(number as usize)?.as_mut()
    }

    /// Close and unassign a channel, freeing its slot. Runs in cleanup
    /// paths, so failures are logged and swallowed; the channel object is
    /// removed regardless.
    pub fn release_channel(&mut self, number: u8) {
        let Some(channel) = self.channels.get_mut(number as usize).and_then(Option::take) else {
            return;
        };
        if channel.state() == ChannelState::Closed {
            return;
        }
        if let Err(e) = self.link.request(
            &message::close_channel(number),
            number,
            message::MESG_CLOSE_CHANNEL_ID,
        ) {
            debug!("error closing channel {}: {}", number, e);
            return;
        }
        // The matching EVENT_CHANNEL_CLOSED arrives later and is dropped
        // as unrouted once the channel is gone.
        if let Err(e) = self.link.request(
            &message::unassign_channel(number),
            number,
            message::MESG_UNASSIGN_CHANNEL_ID,
        ) {
            debug!("error unassigning channel {}: {}", number, e);
        }
    }

    /// Dispatch one pending frame: the oldest delayed frame if any,
    /// otherwise whatever a short poll of the dongle produces.
    pub fn tick(&mut self) -> Result<()> {
        let mesg = match self.link.delayed.pop_front() {
            Some(mesg) => Some(mesg),
            None => self.link.try_next_message()?,
        };
        match mesg {
            Some(mesg) => self.route(&mesg),
            None => Ok(()),
        }
    }

    fn route(&mut self, mesg: &Message) -> Result<()> {
        let Some(number) = mesg.channel() else {
            trace!("dropping unrouted message {:#04x}", mesg.id);
            return Ok(());
        };
        let Some(channel) = self
            .channels
            .get_mut(number as usize)
            .and_then(Option::as_mut)
        else {
            trace!(
                "dropping message {:#04x} for unknown channel {}",
                mesg.id,
                number
            );
            return Ok(());
        };
        match channel.handle_message(&mut self.link, mesg) {
            Ok(()) => Ok(()),
            // A channel that violates the protocol or pairs with the wrong
            // device is shut down; the dongle itself is still healthy.
            Err(e @ (AntError::Protocol(_) | AntError::PairingMismatch)) => {
                error!("channel {} failed: {}; closing it", number, e);
                channel.fail();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
