/// A channel is the means of communication with a single ANT+ master device.
/// The dongle multiplexes several channels; each one is configured for a
/// device type and (optionally) a specific device number, then opened. The
/// first master whose broadcast matches is paired to the channel, and the
/// channel stays locked to it until it drops back to search or closes.
use std::collections::VecDeque;

use log::{debug, info, trace, warn};

use crate::ant::Link;
use crate::device::Profile;
use crate::message::{self, Message};
use crate::usb::Transport;
use crate::{error::AntError, Result};

/// Data-page request payload id (ANT+ common page 70).
const DP_REQUEST: u8 = 0x46;
/// How many times the master is asked to transmit a requested page; repeats
/// cover pages lost to channel collisions.
const DP_REQUEST_TRANSMIT_COUNT: u8 = 4;

/// Identity of the master the channel pairs with. A device number of 0
/// means "search for any device of this type"; the real number is learned
/// from the first RESPONSE_CHANNEL_ID after pairing. Device numbers are 20
/// bits wide, the upper four bits carried in the transmission type byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelId {
    pub device_type: u8,
    pub device_number: u32,
    pub transmission_type: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Searching for a master to pair with.
    Searching,
    /// Paired and receiving broadcast data.
    Open,
    /// Closed for good; build a new channel to pair again.
    Closed,
}

/// Channel events delivered inside CHANNEL_RESPONSE messages, from the
/// "Channel Response / Event Messages" section of the ANT message protocol
/// document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    ResponseNoError,
    RxSearchTimeout,
    RxFail,
    Tx,
    TransferRxFailed,
    TransferTxCompleted,
    TransferTxFailed,
    ChannelClosed,
    RxFailGoToSearch,
    ChannelCollision,
    ChannelInWrongState,
    Unknown(u8),
}

impl ChannelEvent {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ChannelEvent::ResponseNoError,
            0x01 => ChannelEvent::RxSearchTimeout,
            0x02 => ChannelEvent::RxFail,
            0x03 => ChannelEvent::Tx,
            0x04 => ChannelEvent::TransferRxFailed,
            0x05 => ChannelEvent::TransferTxCompleted,
            0x06 => ChannelEvent::TransferTxFailed,
            0x07 => ChannelEvent::ChannelClosed,
            0x08 => ChannelEvent::RxFailGoToSearch,
            0x09 => ChannelEvent::ChannelCollision,
            0x15 => ChannelEvent::ChannelInWrongState,
            other => ChannelEvent::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelEvent::ResponseNoError => "no error",
            ChannelEvent::RxSearchTimeout => "channel search timeout",
            ChannelEvent::RxFail => "rx fail",
            ChannelEvent::Tx => "broadcast tx complete",
            ChannelEvent::TransferRxFailed => "rx transfer fail",
            ChannelEvent::TransferTxCompleted => "tx complete",
            ChannelEvent::TransferTxFailed => "tx fail",
            ChannelEvent::ChannelClosed => "channel closed",
            ChannelEvent::RxFailGoToSearch => "dropped to search mode",
            ChannelEvent::ChannelCollision => "channel collision",
            ChannelEvent::ChannelInWrongState => "channel in wrong state",
            ChannelEvent::Unknown(_) => "unknown channel event",
        }
    }
}

/// Channel configuration parameters, taken from the device profile the
/// channel is opened for.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelConfig {
    device_number: u32,
    device_type: u8,
    frequency: u8,
    period: u16,
    timeout: u8,
}

impl ChannelConfig {
    pub fn new() -> Self {
        ChannelConfig {
            timeout: 30,
            ..Default::default()
        }
    }

    pub fn device_number(mut self, device_number: u32) -> Self {
        self.device_number = device_number;
        self
    }

    pub fn device_type(mut self, device_type: u8) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn frequency(mut self, frequency: u8) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn period(mut self, period: u16) -> Self {
        self.period = period;
        self
    }

    pub fn timeout(mut self, timeout: u8) -> Self {
        self.timeout = timeout;
        self
    }
}

struct AckItem {
    tag: i32,
    data: Vec<u8>,
}

/// Queue of acknowledged-data payloads waiting for a transmission window.
/// The dongle only accepts an ACKNOWLEDGE_DATA submission in the short
/// window after a broadcast reception, so items drain one per broadcast and
/// only while nothing is in flight. Failed transmissions are not retried
/// here; the profile re-enqueues with fresh data if it still wants them.
pub struct AckQueue {
    queue: VecDeque<AckItem>,
    in_flight: bool,
}

impl AckQueue {
    pub(crate) fn new() -> Self {
        AckQueue {
            queue: VecDeque::new(),
            in_flight: false,
        }
    }

    /// Queued (tag, payload) pairs, oldest first.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<(i32, Vec<u8>)> {
        self.queue.iter().map(|i| (i.tag, i.data.clone())).collect()
    }

    /// Queue `payload` (at most 8 bytes) for acknowledged transmission.
    /// `tag` comes back through the profile's ack-reply hook together with
    /// the transmission result.
    pub fn push(&mut self, tag: i32, payload: &[u8]) {
        debug_assert!(payload.len() <= 8);
        self.queue.push_back(AckItem {
            tag,
            data: payload.to_vec(),
        });
    }

    /// Ask the master to transmit the page identified by `page_id`. A
    /// successful acknowledgement only means the request arrived; the page
    /// itself shows up later as an ordinary broadcast.
    pub fn request_data_page(&mut self, page_id: u8) {
        self.push(
            page_id as i32,
            &[
                DP_REQUEST,
                0xFF, // slave serial LSB
                0xFF, // slave serial MSB
                0xFF, // descriptor 1
                0xFF, // descriptor 2
                DP_REQUEST_TRANSMIT_COUNT,
                page_id,
                0x01, // command type: request data page
            ],
        );
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    fn take_reply(&mut self) -> Option<i32> {
        let item = self.queue.pop_front()?;
        self.in_flight = false;
        Some(item.tag)
    }
}

/// Per-channel state: the pairing state machine, the acknowledged-data
/// queue, and the device profile that interprets broadcast pages.
pub struct Channel {
    number: u8,
    state: ChannelState,
    id: ChannelId,
    ack: AckQueue,
    id_request_outstanding: bool,
    messages_received: u32,
    messages_failed: u32,
    profile: Profile,
}

impl Channel {
    /// Assign and open a channel slot on the dongle. Every configuration
    /// write is confirmed before the next is sent; any failure aborts the
    /// construction.
    pub(crate) fn configure<T: Transport>(
        link: &mut Link<T>,
        number: u8,
        network: u8,
        config: ChannelConfig,
        profile: Profile,
    ) -> Result<Channel> {
        link.request(
            &message::assign_channel(number, message::CHANNEL_TYPE_BIDIRECTIONAL_RECEIVE, network),
            number,
            message::MESG_ASSIGN_CHANNEL_ID,
        )?;
        link.request(
            &message::set_channel_id(number, config.device_number, config.device_type),
            number,
            message::MESG_CHANNEL_ID_ID,
        )?;
        link.request(
            &message::set_channel_period(number, config.period),
            number,
            message::MESG_CHANNEL_MESG_PERIOD_ID,
        )?;
        link.request(
            &message::set_search_timeout(number, config.timeout),
            number,
            message::MESG_CHANNEL_SEARCH_TIMEOUT_ID,
        )?;
        link.request(
            &message::set_channel_frequency(number, config.frequency),
            number,
            message::MESG_CHANNEL_RADIO_FREQ_ID,
        )?;
        link.request(
            &message::open_channel(number),
            number,
            message::MESG_OPEN_CHANNEL_ID,
        )?;

        debug!(
            "channel {} open, searching for device type {:#04x} number {}",
            number, config.device_type, config.device_number
        );

        Ok(Channel {
            number,
            state: ChannelState::Searching,
            id: ChannelId {
                device_type: config.device_type,
                device_number: config.device_number,
                transmission_type: 0,
            },
            ack: AckQueue::new(),
            id_request_outstanding: false,
            messages_received: 0,
            messages_failed: 0,
            profile,
        })
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Broadcast messages received so far.
    pub fn messages_received(&self) -> u32 {
        self.messages_received
    }

    /// Reception slots the master missed.
    pub fn messages_failed(&self) -> u32 {
        self.messages_failed
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    #[cfg(test)]
    pub(crate) fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    /// Set the simulated track slope (percent grade) on an FE-C profile.
    /// No-op for other profiles.
    pub fn set_slope(&mut self, slope: f64) {
        if let Profile::Fec(fec) = &mut self.profile {
            fec.set_slope(slope, &mut self.ack);
        }
    }

    /// Update rider and bike parameters on an FE-C profile. No-op for
    /// other profiles.
    pub fn set_user_params(&mut self, user_weight: f64, bike_weight: f64, wheel_diameter: f64) {
        if let Profile::Fec(fec) = &mut self.profile {
            fec.set_user_params(user_weight, bike_weight, wheel_diameter);
        }
    }

    /// Mark the channel dead after an unrecoverable per-channel error.
    pub(crate) fn fail(&mut self) {
        self.change_state(ChannelState::Closed);
    }

    /// Route one inbound frame, invoked by the dongle controller's tick.
    pub(crate) fn handle_message<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        mesg: &Message,
    ) -> Result<()> {
        if self.state == ChannelState::Closed {
            trace!("channel {} received a message while closed", self.number);
            return Ok(());
        }

        match mesg.id {
            message::MESG_RESPONSE_EVENT_ID => self.on_channel_response(link, mesg),
            message::MESG_BROADCAST_DATA_ID => {
                if self.id.device_number == 0 && !self.id_request_outstanding {
                    // Somebody is broadcasting to us and we don't know who;
                    // ask the dongle for the learned channel id.
                    link.write_message(&message::request_message(
                        self.number,
                        message::MESG_CHANNEL_ID_ID,
                    ))?;
                    self.id_request_outstanding = true;
                }
                self.maybe_send_ack(link)?;
                let Channel {
                    profile, id, ack, ..
                } = self;
                profile.on_frame(mesg, id, ack);
                self.messages_received += 1;
                Ok(())
            }
            message::MESG_CHANNEL_ID_ID => self.on_channel_id(mesg),
            _ => {
                let Channel {
                    profile, id, ack, ..
                } = self;
                profile.on_frame(mesg, id, ack);
                Ok(())
            }
        }
    }

    /// Interpret the inner (message id, event) pair of a CHANNEL_RESPONSE.
    fn on_channel_response<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        mesg: &Message,
    ) -> Result<()> {
        if mesg.data.len() < 3 {
            return Err(AntError::Protocol(format!(
                "short channel response on channel {}",
                self.number
            )));
        }
        let msg_id = mesg.data[1];
        let event = ChannelEvent::from_code(mesg.data[2]);

        // An inner message id of 1 marks a channel event; anything else is
        // a reply to a configuration command, which the synchronous request
        // path consumes before it ever reaches us.
        if msg_id != message::MESG_EVENT_ID {
            trace!(
                "channel {}: unexpected reply for command {:#04x}: {}",
                self.number,
                msg_id,
                event.as_str()
            );
            return Ok(());
        }

        match event {
            ChannelEvent::RxFail => {
                self.messages_failed += 1;
                Ok(())
            }
            ChannelEvent::RxSearchTimeout => {
                // The dongle closes the channel on its own; wait for the
                // closed event.
                Ok(())
            }
            ChannelEvent::ChannelClosed => {
                if self.state != ChannelState::Closed {
                    self.change_state(ChannelState::Closed);
                    link.request(
                        &message::unassign_channel(self.number),
                        self.number,
                        message::MESG_UNASSIGN_CHANNEL_ID,
                    )?;
                }
                Ok(())
            }
            ChannelEvent::RxFailGoToSearch => {
                // Lost the master; its broadcasts will pair us again.
                self.id.device_number = 0;
                self.change_state(ChannelState::Searching);
                Ok(())
            }
            ChannelEvent::ResponseNoError => Ok(()),
            other => {
                if self.ack.in_flight {
                    let tag = self.ack.take_reply().unwrap_or_default();
                    let Channel { profile, ack, .. } = self;
                    profile.on_ack_reply(tag, other, ack);
                } else {
                    trace!(
                        "channel {}: unexpected channel event {}",
                        self.number,
                        other.as_str()
                    );
                }
                Ok(())
            }
        }
    }

    /// Learn or verify the master's identity from a RESPONSE_CHANNEL_ID.
    fn on_channel_id(&mut self, mesg: &Message) -> Result<()> {
        if mesg.data.len() < 5 {
            return Err(AntError::Protocol(format!(
                "short channel id response on channel {}",
                self.number
            )));
        }
        if mesg.data[0] != self.number {
            return Err(AntError::Protocol(format!(
                "channel id response for channel {} routed to channel {}",
                mesg.data[0], self.number
            )));
        }

        // High nibble of the transmission type byte extends the device
        // number to 20 bits.
        let device_number = mesg.data[1] as u32
            | (mesg.data[2] as u32) << 8
            | (((mesg.data[4] >> 4) & 0x0F) as u32) << 16;
        let device_type = mesg.data[3];
        let transmission_type = mesg.data[4] & 0x03;

        if self.id.device_type == 0 {
            self.id.device_type = device_type;
        } else if self.id.device_type != device_type {
            warn!(
                "channel {} paired with device type {:#04x}, wanted {:#04x}",
                self.number, device_type, self.id.device_type
            );
            return Err(AntError::PairingMismatch);
        }

        if self.id.device_number == 0 {
            self.id.device_number = device_number;
        } else if self.id.device_number != device_number {
            warn!(
                "channel {} paired with device {}, wanted {}",
                self.number, device_number, self.id.device_number
            );
            return Err(AntError::PairingMismatch);
        }

        self.id.transmission_type = transmission_type;

        // The first responses during pairing can still carry a zero device
        // number; stay in search until a real one is learned.
        if self.id.device_number != 0 {
            self.change_state(ChannelState::Open);
        }

        self.id_request_outstanding = false;
        Ok(())
    }

    /// Send the next queued acknowledged payload if the transmission
    /// window is free. Called on each broadcast reception.
    fn maybe_send_ack<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        if self.ack.in_flight {
            return Ok(());
        }
        if let Some(item) = self.ack.queue.front() {
            link.write_message(&message::acknowledge_data(self.number, &item.data))?;
            self.ack.in_flight = true;
        }
        Ok(())
    }

    fn change_state(&mut self, new_state: ChannelState) {
        let old_state = self.state;
        if old_state != new_state {
            info!("channel {}: {:?} -> {:?}", self.number, old_state, new_state);
            let Channel { profile, id, .. } = self;
            profile.on_state_change(old_state, new_state, id);
            self.state = new_state;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ChannelConfig::new()
            .device_type(0x78)
            .device_number(0x2211)
            .period(8070)
            .frequency(57);
        assert_eq!(config.device_type, 0x78);
        assert_eq!(config.device_number, 0x2211);
        assert_eq!(config.period, 8070);
        assert_eq!(config.frequency, 57);
        // Default search timeout from ChannelConfig::new.
        assert_eq!(config.timeout, 30);
    }

    #[test]
    fn ack_queue_holds_items_until_replied() {
        let mut ack = AckQueue::new();
        ack.push(1, &[0x10; 8]);
        ack.push(2, &[0x20; 8]);
        assert!(!ack.in_flight());
        ack.in_flight = true;
        assert_eq!(ack.take_reply(), Some(1));
        assert!(!ack.in_flight());
        ack.in_flight = true;
        assert_eq!(ack.take_reply(), Some(2));
        assert_eq!(ack.take_reply(), None);
    }

    #[test]
    fn request_data_page_payload() {
        let mut ack = AckQueue::new();
        ack.request_data_page(0x36);
        let item = ack.queue.front().unwrap();
        assert_eq!(item.tag, 0x36);
        assert_eq!(item.data[..], [0x46, 0xFF, 0xFF, 0xFF, 0xFF, 4, 0x36, 0x01]);
    }

    #[test]
    fn channel_event_codes() {
        assert_eq!(ChannelEvent::from_code(0x05), ChannelEvent::TransferTxCompleted);
        assert_eq!(ChannelEvent::from_code(0x07), ChannelEvent::ChannelClosed);
        assert_eq!(ChannelEvent::from_code(0x08), ChannelEvent::RxFailGoToSearch);
        assert_eq!(ChannelEvent::from_code(0xEE), ChannelEvent::Unknown(0xEE));
        assert_eq!(ChannelEvent::from_code(0x06).as_str(), "tx fail");
    }
}
