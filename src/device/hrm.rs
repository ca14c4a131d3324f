/// Heart rate monitor profile, receive only. Every broadcast page carries
/// the same three trailing fields regardless of the page number, so no page
/// dispatch is needed; legacy monitors without data pages decode the same
/// way.
use std::time::Instant;

use log::info;

use super::STALE_TIMEOUT;
use crate::channel::{ChannelConfig, ChannelId, ChannelState};
use crate::message::{self, bytes_to_u16, Message};

pub const HRM_DEVICE_TYPE: u8 = 0x78;
const CHANNEL_PERIOD: u16 = 8070;
const CHANNEL_FREQUENCY: u8 = 57;
const SEARCH_TIMEOUT: u8 = 30;

#[derive(Debug, Default)]
pub struct HeartRateMonitor {
    measurement_time: u16,
    last_measurement_time: u16,
    heart_beats: u8,
    instant_heart_rate: u8,
    updated_at: Option<Instant>,
}

impl HeartRateMonitor {
    pub fn new() -> Self {
        Default::default()
    }

    /// Channel parameters from the heart rate device profile. Pass a device
    /// number of 0 to pair with any monitor in range.
    pub fn channel_config(device_number: u32) -> ChannelConfig {
        ChannelConfig::new()
            .device_type(HRM_DEVICE_TYPE)
            .device_number(device_number)
            .period(CHANNEL_PERIOD)
            .frequency(CHANNEL_FREQUENCY)
            .timeout(SEARCH_TIMEOUT)
    }

    /// Latest heart rate in beats per minute, or 0 when the reading has
    /// gone stale.
    pub fn instant_heart_rate(&self) -> u8 {
        match self.updated_at {
            Some(at) if at.elapsed() <= STALE_TIMEOUT => self.instant_heart_rate,
            _ => 0,
        }
    }

    /// Time of the last heart beat event, in 1/1024 s units.
    pub fn measurement_time(&self) -> u16 {
        self.measurement_time
    }

    /// Running heart beat counter from the monitor.
    pub fn heart_beats(&self) -> u8 {
        self.heart_beats
    }

    pub(crate) fn on_frame(&mut self, mesg: &Message) {
        if mesg.id != message::MESG_BROADCAST_DATA_ID || mesg.data.len() < 9 {
            return;
        }
        let page = &mesg.data[1..9];
        // The last three payload bytes are page independent.
        self.last_measurement_time = self.measurement_time;
        self.measurement_time = bytes_to_u16(&page[4..6]);
        self.heart_beats = page[6];
        self.instant_heart_rate = page[7];
        self.updated_at = Some(Instant::now());
    }

    pub(crate) fn on_state_change(
        &mut self,
        _old_state: ChannelState,
        new_state: ChannelState,
        id: &ChannelId,
    ) {
        if new_state == ChannelState::Open {
            info!("connected to HRM with serial {}", id.device_number);
        } else {
            *self = HeartRateMonitor::new();
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: std::time::Duration) {
        if let Some(at) = self.updated_at.as_mut() {
            *at -= by;
        }
    }
}
