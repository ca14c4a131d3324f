/// Fitness Equipment Control profile. Bidirectional: the trainer broadcasts
/// telemetry pages at its channel period, and we answer in the acknowledged
/// data window with capability requests, user configuration, and resistance
/// commands.
use std::time::Instant;

use log::{debug, info, trace};

use super::STALE_TIMEOUT;
use crate::channel::{AckQueue, ChannelConfig, ChannelEvent, ChannelId, ChannelState};
use crate::message::{self, bytes_to_u16, Message};

pub const FEC_DEVICE_TYPE: u8 = 0x11;
const CHANNEL_PERIOD: u16 = 8192;
const CHANNEL_FREQUENCY: u8 = 57;
const SEARCH_TIMEOUT: u8 = 30;

// Data page numbers from the fitness equipment device profile.
const DP_GENERAL: u8 = 0x10;
const DP_TRAINER_SPECIFIC: u8 = 0x19;
const DP_BASIC_RESISTANCE: u8 = 0x30;
const DP_TARGET_POWER: u8 = 0x31;
const DP_WIND_RESISTANCE: u8 = 0x32;
const DP_TRACK_RESISTANCE: u8 = 0x33;
const DP_FE_CAPABILITIES: u8 = 0x36;
const DP_USER_CONFIG: u8 = 0x37;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EquipmentType {
    Unknown,
    General,
    Treadmill,
    Elliptical,
    StationaryBike,
    Rower,
    Climber,
    NordicSkier,
    Trainer,
}

impl EquipmentType {
    fn from_code(code: u8) -> Self {
        match code {
            16 => EquipmentType::General,
            19 => EquipmentType::Treadmill,
            20 => EquipmentType::Elliptical,
            21 => EquipmentType::StationaryBike,
            22 => EquipmentType::Rower,
            23 => EquipmentType::Climber,
            24 => EquipmentType::NordicSkier,
            25 => EquipmentType::Trainer,
            _ => EquipmentType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentType::Unknown => "unknown",
            EquipmentType::General => "general",
            EquipmentType::Treadmill => "treadmill",
            EquipmentType::Elliptical => "elliptical",
            EquipmentType::StationaryBike => "stationary bike",
            EquipmentType::Rower => "rower",
            EquipmentType::Climber => "climber",
            EquipmentType::NordicSkier => "nordic skier",
            EquipmentType::Trainer => "trainer",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainerState {
    Reserved,
    Asleep,
    Ready,
    InUse,
    Finished,
}

impl TrainerState {
    fn from_code(code: u8) -> Self {
        match code {
            1 => TrainerState::Asleep,
            2 => TrainerState::Ready,
            3 => TrainerState::InUse,
            4 => TrainerState::Finished,
            _ => TrainerState::Reserved,
        }
    }
}

/// Target power feedback while the trainer is in target power mode;
/// `AtTargetPower` otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulationState {
    AtTargetPower,
    SpeedTooLow,
    SpeedTooHigh,
    PowerLimitReached,
}

impl SimulationState {
    fn from_code(code: u8) -> Self {
        match code & 0x03 {
            1 => SimulationState::SpeedTooLow,
            2 => SimulationState::SpeedTooHigh,
            3 => SimulationState::PowerLimitReached,
            _ => SimulationState::AtTargetPower,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CapabilitiesStatus {
    Unknown,
    Requested,
    Received,
}

pub struct FitnessEquipmentControl {
    // User configuration
    must_send_user_config: bool,
    user_weight: f64,    // kg
    bike_weight: f64,    // kg
    wheel_diameter: f64, // m

    // Parameters used when the trainer is in simulation mode
    wind_resistance_coefficient: f64,
    wind_speed: f64,
    drafting_factor: f64,
    slope: f64,
    rolling_resistance: f64,

    // Trainer capabilities
    capabilities_status: CapabilitiesStatus,
    max_resistance: u16, // Newtons
    basic_resistance_control: bool,
    target_power_control: bool,
    simulation_control: bool,
    equipment_type: EquipmentType,

    // Configuration/calibration status reported by the trainer
    zero_offset_calibration_required: bool,
    spin_down_calibration_required: bool,
    user_configuration_required: bool,

    // Trainer output parameters
    instant_power: u16,  // W
    instant_speed: f64,  // m/s
    instant_speed_is_virtual: bool,
    instant_cadence: u8, // rpm
    trainer_state: TrainerState,
    simulation_state: SimulationState,
    power_updated_at: Option<Instant>,
}

impl FitnessEquipmentControl {
    pub fn new() -> Self {
        FitnessEquipmentControl {
            // Reasonable defaults until the application supplies real
            // rider parameters; sent to the trainer once capabilities are
            // known.
            must_send_user_config: true,
            user_weight: 75.0,
            bike_weight: 10.0,
            wheel_diameter: 0.668,

            wind_resistance_coefficient: 0.51,
            wind_speed: 0.0,
            // 1.0 means no drafting effect, riding alone.
            drafting_factor: 1.0,
            slope: 0.0,
            // Recommended value for an asphalt road.
            rolling_resistance: 0.004,

            capabilities_status: CapabilitiesStatus::Unknown,
            max_resistance: 0,
            basic_resistance_control: false,
            target_power_control: false,
            simulation_control: false,
            equipment_type: EquipmentType::Unknown,

            zero_offset_calibration_required: false,
            spin_down_calibration_required: false,
            user_configuration_required: false,

            instant_power: 0,
            instant_speed: 0.0,
            instant_speed_is_virtual: false,
            instant_cadence: 0,
            trainer_state: TrainerState::Reserved,
            simulation_state: SimulationState::AtTargetPower,
            power_updated_at: None,
        }
    }

    /// Channel parameters from the fitness equipment device profile. Pass
    /// a device number of 0 to pair with any trainer in range.
    pub fn channel_config(device_number: u32) -> ChannelConfig {
        ChannelConfig::new()
            .device_type(FEC_DEVICE_TYPE)
            .device_number(device_number)
            .period(CHANNEL_PERIOD)
            .frequency(CHANNEL_FREQUENCY)
            .timeout(SEARCH_TIMEOUT)
    }

    // Speed and cadence staleness is governed by the power timestamp: the
    // trainer interleaves the general and trainer-specific pages on the
    // same channel period, so one timestamp covers the set.

    /// Instant power in watts, or 0 when the reading has gone stale.
    pub fn instant_power(&self) -> u16 {
        if self.is_fresh() {
            self.instant_power
        } else {
            0
        }
    }

    /// Instant speed in m/s, or 0 when the reading has gone stale.
    pub fn instant_speed(&self) -> f64 {
        if self.is_fresh() {
            self.instant_speed
        } else {
            0.0
        }
    }

    /// Whether the reported speed is simulated by the trainer rather than
    /// measured at the wheel.
    pub fn instant_speed_is_virtual(&self) -> bool {
        self.instant_speed_is_virtual
    }

    /// Instant cadence in rpm, or 0 when the reading has gone stale.
    pub fn instant_cadence(&self) -> u8 {
        if self.is_fresh() {
            self.instant_cadence
        } else {
            0
        }
    }

    pub fn equipment_type(&self) -> EquipmentType {
        self.equipment_type
    }

    pub fn trainer_state(&self) -> TrainerState {
        self.trainer_state
    }

    pub fn simulation_state(&self) -> SimulationState {
        self.simulation_state
    }

    /// Maximum resistance in Newtons, 0 until the capabilities page has
    /// been received.
    pub fn max_resistance(&self) -> u16 {
        self.max_resistance
    }

    pub fn supports_basic_resistance(&self) -> bool {
        self.basic_resistance_control
    }

    pub fn supports_target_power(&self) -> bool {
        self.target_power_control
    }

    pub fn supports_simulation(&self) -> bool {
        self.simulation_control
    }

    pub fn zero_offset_calibration_required(&self) -> bool {
        self.zero_offset_calibration_required
    }

    pub fn spin_down_calibration_required(&self) -> bool {
        self.spin_down_calibration_required
    }

    pub fn user_configuration_required(&self) -> bool {
        self.user_configuration_required
    }

    fn is_fresh(&self) -> bool {
        matches!(self.power_updated_at, Some(at) if at.elapsed() <= STALE_TIMEOUT)
    }

    /// Update rider and bike parameters; the user configuration page is
    /// re-sent on the next broadcast window.
    pub fn set_user_params(&mut self, user_weight: f64, bike_weight: f64, wheel_diameter: f64) {
        self.user_weight = user_weight;
        self.bike_weight = bike_weight;
        self.wheel_diameter = wheel_diameter;
        self.must_send_user_config = true;
    }

    /// Set the simulated track slope in percent grade and queue the track
    /// resistance page carrying it.
    pub fn set_slope(&mut self, slope: f64, ack: &mut AckQueue) {
        info!("set slope to {}", slope);
        self.slope = slope;
        self.send_track_resistance(ack);
    }

    pub(crate) fn on_frame(&mut self, mesg: &Message, id: &ChannelId, ack: &mut AckQueue) {
        if mesg.id != message::MESG_BROADCAST_DATA_ID || mesg.data.len() < 9 {
            return;
        }
        let page = &mesg.data[1..9];
        match page[0] {
            DP_GENERAL => self.process_general_page(page),
            DP_TRAINER_SPECIFIC => self.process_trainer_specific_page(page),
            DP_FE_CAPABILITIES => self.process_capabilities_page(page),
            other => trace!("unhandled fitness equipment data page {:#04x}", other),
        }

        // One control item per broadcast window, most important first.
        if id.device_number == 0 {
            // Don't request anything until pairing has completed.
        } else if self.capabilities_status == CapabilitiesStatus::Unknown {
            ack.request_data_page(DP_FE_CAPABILITIES);
            self.capabilities_status = CapabilitiesStatus::Requested;
        } else if self.must_send_user_config {
            self.send_user_config(ack);
        }
    }

    fn process_general_page(&mut self, page: &[u8]) {
        self.equipment_type = EquipmentType::from_code(page[1] & 0x1F);
        self.instant_speed = bytes_to_u16(&page[4..6]) as f64 * 0.001;
        let capabilities = page[7] & 0x0F;
        self.instant_speed_is_virtual = (capabilities & 0x03) != 0;
        // Bit 3 of the state nibble is the lap toggle, which we don't use.
        self.trainer_state = TrainerState::from_code((page[7] >> 4) & 0x07);
    }

    fn process_trainer_specific_page(&mut self, page: &[u8]) {
        self.instant_cadence = page[2];
        self.instant_power = ((page[6] & 0x0F) as u16) << 8 | page[5] as u16;
        self.trainer_state = TrainerState::from_code((page[7] >> 4) & 0x07);
        self.simulation_state = SimulationState::from_code(page[7] & 0x03);

        let trainer_status = (page[6] >> 4) & 0x0F;
        self.zero_offset_calibration_required = (trainer_status & 0x01) != 0;
        self.spin_down_calibration_required = (trainer_status & 0x02) != 0;
        self.user_configuration_required = (trainer_status & 0x04) != 0;
        self.must_send_user_config |= self.user_configuration_required;

        self.power_updated_at = Some(Instant::now());
    }

    fn process_capabilities_page(&mut self, page: &[u8]) {
        let max_resistance = bytes_to_u16(&page[5..7]);
        let capabilities = page[7];
        let basic_resistance_control = (capabilities & 0x01) != 0;
        let target_power_control = (capabilities & 0x02) != 0;
        let simulation_control = (capabilities & 0x04) != 0;

        // The page can arrive repeatedly; only record and log changes.
        if self.capabilities_status != CapabilitiesStatus::Received
            || basic_resistance_control != self.basic_resistance_control
            || target_power_control != self.target_power_control
            || simulation_control != self.simulation_control
        {
            self.capabilities_status = CapabilitiesStatus::Received;
            self.max_resistance = max_resistance;
            self.basic_resistance_control = basic_resistance_control;
            self.target_power_control = target_power_control;
            self.simulation_control = simulation_control;
            info!(
                "trainer capabilities: max resistance {} N, basic resistance {}, target power {}, simulation {}",
                max_resistance, basic_resistance_control, target_power_control, simulation_control
            );
        }
    }

    /// Queue the user configuration page. Weight fields are fixed point:
    /// rider weight in 0.01 kg, bike weight in 0.05 kg split across the
    /// high nibble of byte 4 and all of byte 5, wheel diameter as whole
    /// centimeters plus a millimeter remainder in the low bits of byte 4.
    fn send_user_config(&mut self, ack: &mut AckQueue) {
        debug!(
            "sending user config: rider {} kg, bike {} kg, wheel {} m",
            self.user_weight, self.bike_weight, self.wheel_diameter
        );
        let user_weight = (self.user_weight / 0.01) as u16;
        let bike_weight = (self.bike_weight / 0.05) as u16;
        let wheel_cm = (self.wheel_diameter / 0.01) as u16;
        let wheel_mm = (self.wheel_diameter / 0.001) as u16 - wheel_cm * 10;

        ack.push(
            DP_USER_CONFIG as i32,
            &[
                DP_USER_CONFIG,
                (user_weight & 0xFF) as u8,
                (user_weight >> 8) as u8,
                0xFF, // reserved
                (wheel_mm & 0x03) as u8 | ((bike_weight & 0x0F) as u8) << 4,
                (bike_weight >> 4) as u8,
                wheel_cm as u8,
                0x00, // gear ratio: invalid, let the trainer pick
            ],
        );
        self.must_send_user_config = false;
    }

    /// Queue the track resistance page carrying the current slope and
    /// rolling resistance. Raw slope is offset by 200% in 0.01% units;
    /// raw rolling resistance is in 5e-7 units, clamped to a byte.
    fn send_track_resistance(&mut self, ack: &mut AckQueue) {
        let raw_slope = (((self.slope + 200.0) / 0.01) as u16).min(40000);
        let raw_rolling = (self.rolling_resistance * 5e5).clamp(0.0, 255.0) as u8;
        ack.push(
            DP_TRACK_RESISTANCE as i32,
            &[
                DP_TRACK_RESISTANCE,
                0xFF,
                0xFF,
                0xFF,
                0xFF,
                (raw_slope & 0xFF) as u8,
                (raw_slope >> 8) as u8,
                raw_rolling,
            ],
        );
    }

    pub(crate) fn on_ack_reply(&mut self, tag: i32, event: ChannelEvent, ack: &mut AckQueue) {
        if event == ChannelEvent::TransferTxCompleted {
            return;
        }
        // Transmission failed; re-arm so the request goes out again with
        // current values.
        if tag == DP_FE_CAPABILITIES as i32 {
            self.capabilities_status = CapabilitiesStatus::Unknown;
        } else if tag == DP_USER_CONFIG as i32 {
            self.must_send_user_config = true;
        } else if tag == DP_TRACK_RESISTANCE as i32 {
            self.send_track_resistance(ack);
        }
    }

    pub(crate) fn on_state_change(
        &mut self,
        _old_state: ChannelState,
        new_state: ChannelState,
        id: &ChannelId,
    ) {
        if new_state == ChannelState::Open {
            info!("connected to ANT+ FE-C with serial {}", id.device_number);
            return;
        }

        // Lost the trainer; forget everything it told us, but keep the
        // user parameters and simulation settings for the reconnect.
        self.capabilities_status = CapabilitiesStatus::Unknown;
        self.max_resistance = 0;
        self.basic_resistance_control = false;
        self.target_power_control = false;
        self.simulation_control = false;

        self.zero_offset_calibration_required = false;
        self.spin_down_calibration_required = false;
        self.user_configuration_required = false;

        self.instant_power = 0;
        self.instant_speed = 0.0;
        self.instant_speed_is_virtual = false;
        self.instant_cadence = 0;
        self.trainer_state = TrainerState::Reserved;
        self.simulation_state = SimulationState::AtTargetPower;
        self.power_updated_at = None;
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: std::time::Duration) {
        if let Some(at) = self.power_updated_at.as_mut() {
            *at -= by;
        }
    }
}

impl Default for FitnessEquipmentControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::message::MESG_BROADCAST_DATA_ID;

    fn broadcast(page: [u8; 8]) -> Message {
        let mut data = vec![0u8];
        data.extend_from_slice(&page);
        Message::new(MESG_BROADCAST_DATA_ID, &data)
    }

    fn paired_id() -> ChannelId {
        ChannelId {
            device_type: FEC_DEVICE_TYPE,
            device_number: 0x2211,
            transmission_type: 1,
        }
    }

    #[test]
    fn channel_config_matches_device_profile() {
        let config = FitnessEquipmentControl::channel_config(0);
        assert_eq!(
            config,
            ChannelConfig::new()
                .device_type(0x11)
                .period(8192)
                .frequency(57)
                .timeout(30)
        );
    }

    #[test]
    fn general_page_decodes_speed_and_state() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        // Equipment type 25 (trainer), 4200 mm/s, virtual speed, in use.
        fec.on_frame(
            &broadcast([0x10, 25, 0, 0, 0x68, 0x10, 0, 0x31]),
            &ChannelId::default(),
            &mut ack,
        );
        assert_eq!(fec.equipment_type(), EquipmentType::Trainer);
        assert!(fec.instant_speed_is_virtual());
        assert_eq!(fec.trainer_state(), TrainerState::InUse);
        // Speed is gated on the power timestamp, which has not been set.
        assert_eq!(fec.instant_speed(), 0.0);
    }

    #[test]
    fn trainer_page_decodes_power_cadence_and_flags() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        // Cadence 90 rpm, power 0x1F4 = 500 W, user config required.
        fec.on_frame(
            &broadcast([0x19, 0, 90, 0, 0, 0xF4, 0x41, 0x30]),
            &ChannelId::default(),
            &mut ack,
        );
        assert_eq!(fec.instant_power(), 500);
        assert_eq!(fec.instant_cadence(), 90);
        assert!(fec.user_configuration_required());
        assert_eq!(fec.trainer_state(), TrainerState::InUse);

        // Interleaved general page: its speed is fresh under the power
        // timestamp.
        fec.on_frame(
            &broadcast([0x10, 25, 0, 0, 0x68, 0x10, 0, 0x30]),
            &ChannelId::default(),
            &mut ack,
        );
        assert!((fec.instant_speed() - 4.2).abs() < 1e-9);
    }

    #[test]
    fn readings_go_stale_on_power_timestamp() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        fec.on_frame(
            &broadcast([0x19, 0, 90, 0, 0, 0xF4, 0x01, 0x00]),
            &ChannelId::default(),
            &mut ack,
        );
        assert_eq!(fec.instant_power(), 500);
        fec.backdate(Duration::from_millis(6000));
        assert_eq!(fec.instant_power(), 0);
        assert_eq!(fec.instant_cadence(), 0);
        assert_eq!(fec.instant_speed(), 0.0);
    }

    #[test]
    fn requests_capabilities_once_paired() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();

        // Not paired yet: no control traffic.
        fec.on_frame(
            &broadcast([0x10, 25, 0, 0, 0, 0, 0, 0]),
            &ChannelId::default(),
            &mut ack,
        );
        assert!(ack.queued().is_empty());

        fec.on_frame(&broadcast([0x10, 25, 0, 0, 0, 0, 0, 0]), &paired_id(), &mut ack);
        let queued = ack.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, 0x36);
        assert_eq!(queued[0].1[..], [0x46, 0xFF, 0xFF, 0xFF, 0xFF, 0x04, 0x36, 0x01]);

        // Requested: not asked again on the next broadcast.
        fec.on_frame(&broadcast([0x10, 25, 0, 0, 0, 0, 0, 0]), &paired_id(), &mut ack);
        assert_eq!(ack.queued().len(), 2); // capabilities request + user config
    }

    #[test]
    fn capabilities_page_recorded_once() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        // Max resistance 500 N, basic + simulation control.
        fec.on_frame(
            &broadcast([0x36, 0xFF, 0xFF, 0xFF, 0xFF, 0xF4, 0x01, 0x05]),
            &paired_id(),
            &mut ack,
        );
        assert_eq!(fec.max_resistance(), 500);
        assert!(fec.supports_basic_resistance());
        assert!(!fec.supports_target_power());
        assert!(fec.supports_simulation());
    }

    #[test]
    fn slope_command_payload() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        fec.set_slope(2.5, &mut ack);
        let queued = ack.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, 0x33);
        // raw slope (2.5 + 200) / 0.01 = 20250 = 0x4F1A; rolling
        // resistance 0.004 * 5e5 = 2000 clamps to 0xFF.
        assert_eq!(
            queued[0].1[..],
            [0x33, 0xFF, 0xFF, 0xFF, 0xFF, 0x1A, 0x4F, 0xFF]
        );
    }

    #[test]
    fn slope_clamps_to_encodable_range() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        fec.set_slope(500.0, &mut ack);
        let queued = ack.queued();
        assert_eq!(bytes_to_u16(&queued[0].1[5..7]), 40000);

        let mut ack = AckQueue::new();
        fec.set_slope(-500.0, &mut ack);
        let queued = ack.queued();
        assert_eq!(bytes_to_u16(&queued[0].1[5..7]), 0);
    }

    #[test]
    fn user_config_payload_packing() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        fec.set_user_params(75.0, 10.0, 0.668);
        // Capabilities already known so the user config goes out.
        fec.on_frame(
            &broadcast([0x36, 0xFF, 0xFF, 0xFF, 0xFF, 0xF4, 0x01, 0x05]),
            &paired_id(),
            &mut ack,
        );
        let queued = ack.queued();
        assert_eq!(queued.len(), 1);
        let payload = &queued[0].1;
        assert_eq!(payload[0], 0x37);
        // 75.0 kg -> 7500 = 0x1D4C
        assert_eq!(payload[1], 0x4C);
        assert_eq!(payload[2], 0x1D);
        assert_eq!(payload[3], 0xFF);
        // 10.0 kg -> 200 quanta = 0xC8: low nibble 0x8 in the high nibble
        // of byte 4, 0xC in byte 5; wheel 66.8 cm -> 66 cm + 8 mm, low two
        // bits of the remainder in byte 4.
        assert_eq!(payload[4], (8 & 0x03) | 0x80);
        assert_eq!(payload[5], 0x0C);
        assert_eq!(payload[6], 66);
        assert_eq!(payload[7], 0x00);
    }

    #[test]
    fn failed_ack_rearms_by_tag() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();

        fec.capabilities_status = CapabilitiesStatus::Requested;
        fec.on_ack_reply(0x36, ChannelEvent::TransferTxFailed, &mut ack);
        assert_eq!(fec.capabilities_status, CapabilitiesStatus::Unknown);

        fec.must_send_user_config = false;
        fec.on_ack_reply(0x37, ChannelEvent::TransferTxFailed, &mut ack);
        assert!(fec.must_send_user_config);

        fec.on_ack_reply(0x33, ChannelEvent::TransferTxFailed, &mut ack);
        let queued = ack.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, 0x33);
    }

    #[test]
    fn successful_ack_leaves_state_alone() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        fec.capabilities_status = CapabilitiesStatus::Requested;
        fec.must_send_user_config = false;
        fec.on_ack_reply(0x36, ChannelEvent::TransferTxCompleted, &mut ack);
        assert_eq!(fec.capabilities_status, CapabilitiesStatus::Requested);
        assert!(!fec.must_send_user_config);
        assert!(ack.queued().is_empty());
    }

    #[test]
    fn leaving_open_resets_trainer_state_only() {
        let mut fec = FitnessEquipmentControl::new();
        let mut ack = AckQueue::new();
        fec.set_user_params(80.0, 9.0, 0.7);
        fec.slope = 3.5;
        fec.on_frame(
            &broadcast([0x19, 0, 90, 0, 0, 0xF4, 0x01, 0x00]),
            &paired_id(),
            &mut ack,
        );
        fec.on_state_change(ChannelState::Open, ChannelState::Closed, &paired_id());
        assert_eq!(fec.instant_power(), 0);
        assert_eq!(fec.instant_cadence(), 0);
        // Rider parameters and simulation settings survive for the
        // reconnect.
        assert_eq!(fec.user_weight, 80.0);
        assert_eq!(fec.slope, 3.5);
    }
}
