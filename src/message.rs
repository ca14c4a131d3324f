/// Message module builds the frames written to the ANT+ USB dongle and
/// decodes the byte stream read back from it. An ANT frame on the wire is
/// SYNC, LEN, MSG_ID, LEN payload bytes, and an XOR checksum over everything
/// before it.
use crate::{error::AntError, Result};

pub const MESG_TX_SYNC: u8 = 0xA4;

const MESG_HEADER_SIZE: usize = 3;
const MESG_CHECKSUM_SIZE: usize = 1;
/// Smallest possible frame: SYNC + LEN + MSG_ID + checksum.
const MESG_FRAME_OVERHEAD: usize = 4;

// Inner message id of a CHANNEL_RESPONSE that carries a channel event
// rather than a reply to a configuration command.
pub const MESG_EVENT_ID: u8 = 0x01;

pub const MESG_RESPONSE_EVENT_ID: u8 = 0x40;
pub const MESG_UNASSIGN_CHANNEL_ID: u8 = 0x41;
pub const MESG_ASSIGN_CHANNEL_ID: u8 = 0x42;
pub const MESG_CHANNEL_MESG_PERIOD_ID: u8 = 0x43;
pub const MESG_CHANNEL_SEARCH_TIMEOUT_ID: u8 = 0x44;
pub const MESG_CHANNEL_RADIO_FREQ_ID: u8 = 0x45;
pub const MESG_NETWORK_KEY_ID: u8 = 0x46;
pub const MESG_RESET: u8 = 0x4A;
pub const MESG_OPEN_CHANNEL_ID: u8 = 0x4B;
pub const MESG_CLOSE_CHANNEL_ID: u8 = 0x4C;
pub const MESG_REQUEST: u8 = 0x4D;
pub const MESG_BROADCAST_DATA_ID: u8 = 0x4E;
pub const MESG_ACKNOWLEDGE_DATA_ID: u8 = 0x4F;
pub const MESG_BURST_DATA_ID: u8 = 0x50;
pub const MESG_CHANNEL_ID_ID: u8 = 0x51;
pub const MESG_VERSION_ID: u8 = 0x3E;
pub const MESG_CAPABILITIES_ID: u8 = 0x54;
pub const MESG_SERIAL_NUMBER_ID: u8 = 0x61;
pub const MESG_STARTUP_MESG_ID: u8 = 0x6F;

/// Channel type byte for ASSIGN_CHANNEL. We are always the receiving slave;
/// bidirectional so acknowledged data can be sent back to the master.
pub const CHANNEL_TYPE_BIDIRECTIONAL_RECEIVE: u8 = 0x00;

// Message is the decoded form of a frame: the message id plus the payload
// bytes between the id and the checksum.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: u8, data: &[u8]) -> Message {
        Message {
            id,
            data: data.to_vec(),
        }
    }

    /// Converts a message into the framed bytes written to the dongle.
    pub fn encode(&self) -> Vec<u8> {
        let size = MESG_HEADER_SIZE + self.data.len() + MESG_CHECKSUM_SIZE;
        let mut buf: Vec<u8> = Vec::with_capacity(size);
        buf.push(MESG_TX_SYNC);
        buf.push(self.data.len() as u8);
        buf.push(self.id);
        buf.extend_from_slice(&self.data);
        buf.push(checksum(&buf));
        buf
    }

    /// Channel number the message belongs to, for routing inbound frames.
    /// Burst frames carry a sequence number in the top three bits of the
    /// channel byte.
    pub fn channel(&self) -> Option<u8> {
        let first = *self.data.first()?;
        Some(if self.id == MESG_BURST_DATA_ID {
            first & 0x1F
        } else {
            first
        })
    }
}

pub(crate) fn checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0, |acc, x| acc ^ x)
}

/// ReadBuffer accumulates the raw bytes read from the USB bulk IN endpoint
/// and carves validated frames out of them. A single USB read may hold a
/// fraction of a frame or several frames, so the buffer persists across
/// reads.
pub struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        ReadBuffer {
            buf: Vec::with_capacity(1024),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Produces the next buffered frame, `Ok(None)` if more bytes are
    /// needed, or `AntError::Framing` if the frame at the head of the
    /// buffer fails its checksum. After a checksum failure the bad sync
    /// byte is consumed so the next call resynchronizes on the remainder.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        match self.buf.iter().position(|&b| b == MESG_TX_SYNC) {
            Some(0) => {}
            Some(pos) => {
                self.buf.drain(..pos);
            }
            None => {
                self.buf.clear();
                return Ok(None);
            }
        }

        if self.buf.len() < MESG_FRAME_OVERHEAD {
            return Ok(None);
        }
        let total = self.buf[1] as usize + MESG_FRAME_OVERHEAD;
        if self.buf.len() < total {
            return Ok(None);
        }

        // XOR over the whole frame, checksum included, must come out zero.
        if checksum(&self.buf[..total]) != 0 {
            self.buf.drain(..1);
            return Err(AntError::Framing("bad checksum"));
        }

        let mesg = Message::new(self.buf[2], &self.buf[MESG_HEADER_SIZE..total - 1]);
        self.buf.drain(..total);
        Ok(Some(mesg))
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn reset() -> Message {
    Message::new(MESG_RESET, &[0])
}

pub fn set_network_key(network: u8, key: &[u8; 8]) -> Message {
    let mut data = vec![network];
    data.extend_from_slice(key);
    Message::new(MESG_NETWORK_KEY_ID, &data)
}

/// Ask the dongle to send back the response message identified by `id`,
/// e.g. the serial number, capabilities, or a channel id.
pub fn request_message(channel: u8, id: u8) -> Message {
    Message::new(MESG_REQUEST, &[channel, id])
}

pub fn assign_channel(channel: u8, channel_type: u8, network: u8) -> Message {
    Message::new(MESG_ASSIGN_CHANNEL_ID, &[channel, channel_type, network])
}

/// Device numbers are 20 bits wide; the top four bits ride in the high
/// nibble of the transmission type byte.
pub fn set_channel_id(channel: u8, device_number: u32, device_type: u8) -> Message {
    Message::new(
        MESG_CHANNEL_ID_ID,
        &[
            channel,
            (device_number & 0xFF) as u8,
            ((device_number >> 8) & 0xFF) as u8,
            device_type,
            ((device_number >> 12) & 0xF0) as u8,
        ],
    )
}

pub fn set_channel_period(channel: u8, period: u16) -> Message {
    Message::new(
        MESG_CHANNEL_MESG_PERIOD_ID,
        &[channel, (period & 0xFF) as u8, ((period >> 8) & 0xFF) as u8],
    )
}

pub fn set_search_timeout(channel: u8, timeout: u8) -> Message {
    Message::new(MESG_CHANNEL_SEARCH_TIMEOUT_ID, &[channel, timeout])
}

pub fn set_channel_frequency(channel: u8, frequency: u8) -> Message {
    Message::new(MESG_CHANNEL_RADIO_FREQ_ID, &[channel, frequency])
}

pub fn open_channel(channel: u8) -> Message {
    Message::new(MESG_OPEN_CHANNEL_ID, &[channel])
}

pub fn close_channel(channel: u8) -> Message {
    Message::new(MESG_CLOSE_CHANNEL_ID, &[channel])
}

pub fn unassign_channel(channel: u8) -> Message {
    Message::new(MESG_UNASSIGN_CHANNEL_ID, &[channel])
}

pub fn acknowledge_data(channel: u8, payload: &[u8]) -> Message {
    let mut data = vec![channel];
    data.extend_from_slice(payload);
    Message::new(MESG_ACKNOWLEDGE_DATA_ID, &data)
}

// bytes_to_u16 takes a byte slice formatted in [LSB, MSB] and combines the
// two fields together into a single u16.
pub(crate) fn bytes_to_u16(b: &[u8]) -> u16 {
    match b.len() {
        0 => 0,
        1 => b[0] as u16,
        _ => (b[0] as u16) | ((b[1] as u16) << 8),
    }
}

// bytes_to_u32 combines up to four [LSB..MSB] bytes into a u32.
pub(crate) fn bytes_to_u32(b: &[u8]) -> u32 {
    b.iter()
        .take(4)
        .enumerate()
        .fold(0, |acc, (i, &x)| acc | ((x as u32) << (8 * i)))
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(bytes: &[u8]) -> ReadBuffer {
        let mut buffer = ReadBuffer::new();
        buffer.extend(bytes);
        buffer
    }

    #[test]
    fn test_encode() {
        let data = [MESG_TX_SYNC, 5, MESG_CAPABILITIES_ID, 1, 0xac, 2, 0x5c, 3];
        let m = Message::new(data[2], &data[3..]);
        let buf = m.encode();
        assert_eq!(buf[..8], data);
        assert_eq!(buf[8], checksum(&data));
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&[2, 3]), 1);
    }

    #[test]
    fn test_encoded_frame_xors_to_zero() {
        for len in 0..=255usize {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let frame = Message::new(MESG_BROADCAST_DATA_ID, &payload).encode();
            assert_eq!(frame.len(), len + 4);
            assert_eq!(checksum(&frame), 0);
        }
    }

    #[test]
    fn test_round_trip() {
        for len in 0..=255usize {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 + 5) as u8).collect();
            let mesg = Message::new(MESG_BROADCAST_DATA_ID, &payload);
            let mut buffer = feed(&mesg.encode());
            assert_eq!(buffer.next_message().unwrap(), Some(mesg));
            assert_eq!(buffer.next_message().unwrap(), None);
        }
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let startup = Message::new(MESG_STARTUP_MESG_ID, &[0x20]);
        let mut bytes = startup.encode();
        bytes.extend_from_slice(&startup.encode());
        bytes.extend_from_slice(&startup.encode());
        let mut buffer = feed(&bytes);
        for _ in 0..3 {
            assert_eq!(buffer.next_message().unwrap(), Some(startup.clone()));
        }
        assert_eq!(buffer.next_message().unwrap(), None);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mesg = Message::new(MESG_BROADCAST_DATA_ID, &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        let frame = mesg.encode();
        let mut buffer = ReadBuffer::new();
        buffer.extend(&frame[..3]);
        assert_eq!(buffer.next_message().unwrap(), None);
        buffer.extend(&frame[3..7]);
        assert_eq!(buffer.next_message().unwrap(), None);
        buffer.extend(&frame[7..]);
        assert_eq!(buffer.next_message().unwrap(), Some(mesg));
    }

    #[test]
    fn test_resync_after_garbage() {
        let mesg = Message::new(MESG_STARTUP_MESG_ID, &[0x00]);
        let mut bytes = vec![0x00, 0x13, 0x7f];
        bytes.extend_from_slice(&mesg.encode());
        let mut buffer = feed(&bytes);
        assert_eq!(buffer.next_message().unwrap(), Some(mesg));
        assert_eq!(buffer.next_message().unwrap(), None);
    }

    #[test]
    fn test_single_bit_flip_is_rejected() {
        let frame = Message::new(MESG_BROADCAST_DATA_ID, &[0, 1, 2, 3, 4, 5, 6, 7, 8]).encode();
        // Skip the sync byte: corrupting it makes the frame invisible to the
        // scanner rather than invalid, which the resync test covers.
        for byte in 1..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                // Pad so a corrupted LEN cannot leave the decoder waiting
                // for bytes that never arrive.
                corrupted.extend_from_slice(&[0u8; 256]);
                let mut buffer = feed(&corrupted);
                assert!(
                    buffer.next_message().is_err(),
                    "flip of byte {} bit {} was not rejected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_decode_continues_after_bad_checksum() {
        let good = Message::new(MESG_STARTUP_MESG_ID, &[0x00]);
        let mut bad = good.encode();
        bad[4] ^= 0xFF;
        bad.extend_from_slice(&good.encode());
        let mut buffer = feed(&bad);
        assert!(buffer.next_message().is_err());
        assert_eq!(buffer.next_message().unwrap(), Some(good));
    }

    // The following tests assert against the raw constant values. Since the
    // ids are part of the ANT message protocol, they should never change; a
    // change to a constant above will fail here without a matching change.
    #[test]
    fn test_reset_message() {
        let mesg = reset();
        assert_eq!(mesg.id, 0x4A);
        assert_eq!(mesg.data[..], [0]);
    }

    #[test]
    fn test_set_network_key_message() {
        let mesg = set_network_key(0, &[0; 8]);
        assert_eq!(mesg.id, 0x46);
        assert_eq!(mesg.data[..], [0; 9]);
    }

    #[test]
    fn test_request_message() {
        let mesg = request_message(0, MESG_CAPABILITIES_ID);
        assert_eq!(mesg.id, 0x4D);
        assert_eq!(mesg.data[..], [0, 0x54]);
    }

    #[test]
    fn test_assign_channel_message() {
        let mesg = assign_channel(2, CHANNEL_TYPE_BIDIRECTIONAL_RECEIVE, 0);
        assert_eq!(mesg.id, 0x42);
        assert_eq!(mesg.data[..], [2, 0, 0]);
    }

    #[test]
    fn test_set_channel_id_message() {
        let mesg = set_channel_id(0, 1000, 0x78);
        assert_eq!(mesg.id, 0x51);
        assert_eq!(mesg.data[..], [0, (1000 & 0xFF) as u8, (1000 >> 8) as u8, 0x78, 0]);
    }

    #[test]
    fn test_set_channel_id_packs_20_bit_device_number() {
        let mesg = set_channel_id(1, 0xF_BEEF, 0x11);
        assert_eq!(mesg.data[..], [1, 0xEF, 0xBE, 0x11, 0xF0]);
    }

    #[test]
    fn test_set_channel_period_message() {
        let mesg = set_channel_period(0, 8070);
        assert_eq!(mesg.id, 0x43);
        assert_eq!(mesg.data[..], [0, (8070 & 0xFF) as u8, (8070 >> 8) as u8]);
    }

    #[test]
    fn test_set_search_timeout_message() {
        let mesg = set_search_timeout(0, 30);
        assert_eq!(mesg.id, 0x44);
        assert_eq!(mesg.data[..], [0, 30]);
    }

    #[test]
    fn test_set_channel_frequency_message() {
        let mesg = set_channel_frequency(0, 57);
        assert_eq!(mesg.id, 0x45);
        assert_eq!(mesg.data[..], [0, 57]);
    }

    #[test]
    fn test_open_close_unassign_messages() {
        assert_eq!(open_channel(3).id, 0x4B);
        assert_eq!(close_channel(3).id, 0x4C);
        assert_eq!(unassign_channel(3).id, 0x41);
        assert_eq!(open_channel(3).data[..], [3]);
    }

    #[test]
    fn test_acknowledge_data_message() {
        let mesg = acknowledge_data(1, &[0x33, 0xFF, 0xFF, 0xFF, 0xFF, 0x1A, 0x4F, 0xD0]);
        assert_eq!(mesg.id, 0x4F);
        assert_eq!(mesg.data[0], 1);
        assert_eq!(mesg.data.len(), 9);
    }

    #[test]
    fn test_channel_routing_byte() {
        let broadcast = Message::new(MESG_BROADCAST_DATA_ID, &[3, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(broadcast.channel(), Some(3));
        let burst = Message::new(MESG_BURST_DATA_ID, &[0xE2, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(burst.channel(), Some(2));
        let empty = Message::new(MESG_STARTUP_MESG_ID, &[]);
        assert_eq!(empty.channel(), None);
    }

    #[test]
    fn test_bytes_to_u16() {
        assert_eq!(bytes_to_u16(&[0x7A, 0x00]), 0x007A);
        assert_eq!(bytes_to_u16(&[0x34, 0x12]), 0x1234);
    }

    #[test]
    fn test_bytes_to_u32() {
        assert_eq!(bytes_to_u32(&[0x78, 0x56, 0x34, 0x12]), 0x12345678);
        assert_eq!(bytes_to_u32(&[0x01, 0x02]), 0x0201);
    }
}
