/// Device profiles supported by the library. A channel is opened with one
/// profile, which interprets the broadcast pages received on the channel
/// and drives any control traffic back to the master.
pub mod fec;
pub mod hrm;

use std::time::Duration;

use fec::FitnessEquipmentControl;
use hrm::HeartRateMonitor;

use crate::channel::{AckQueue, ChannelEvent, ChannelId, ChannelState};
use crate::message::Message;

/// How old a reading may get before the accessors stop reporting it.
pub(crate) const STALE_TIMEOUT: Duration = Duration::from_millis(5000);

pub enum Profile {
    HeartRateMonitor(HeartRateMonitor),
    Fec(FitnessEquipmentControl),
}

impl Profile {
    /// A frame arrived on the channel and was not consumed by channel
    /// management.
    pub(crate) fn on_frame(&mut self, mesg: &Message, id: &ChannelId, ack: &mut AckQueue) {
        match self {
            Profile::HeartRateMonitor(hrm) => hrm.on_frame(mesg),
            Profile::Fec(fec) => fec.on_frame(mesg, id, ack),
        }
    }

    pub(crate) fn on_state_change(
        &mut self,
        old_state: ChannelState,
        new_state: ChannelState,
        id: &ChannelId,
    ) {
        match self {
            Profile::HeartRateMonitor(hrm) => hrm.on_state_change(old_state, new_state, id),
            Profile::Fec(fec) => fec.on_state_change(old_state, new_state, id),
        }
    }

    /// The acknowledged transmission tagged `tag` finished with `event`.
    pub(crate) fn on_ack_reply(&mut self, tag: i32, event: ChannelEvent, ack: &mut AckQueue) {
        match self {
            Profile::HeartRateMonitor(_) => {}
            Profile::Fec(fec) => fec.on_ack_reply(tag, event, ack),
        }
    }
}
