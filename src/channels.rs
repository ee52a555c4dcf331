//! # Channels and sequence numbers
//!
//! Both transports multiplex their traffic on logical channels. On Wi-Fi a
//! channel is a buffer id in the frame header, on BLE it is a GATT
//! characteristic. Every channel carries its own 8 bits sequence counter.

use std::collections::HashMap;

use crate::codec::Framing;

/// Direction of a channel, seen from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Controller to drone
    Send,
    /// Drone to controller
    Receive,
}

/// Logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Keep-alive ping from the drone (Wi-Fi)
    Ping,
    /// Keep-alive answer (Wi-Fi)
    Pong,
    /// Commands not acknowledged by the drone
    SendNoAck,
    /// Commands acknowledged by the drone
    SendWithAck,
    /// Low latency commands
    SendHighPriority,
    /// Video acknowledgements (Wi-Fi)
    VideoAck,
    /// Video data (Wi-Fi)
    VideoData,
    /// Sensor data not requiring an acknowledgement
    NoAckDroneData,
    /// Sensor data requiring an acknowledgement
    AckDroneData,
    /// Acknowledgement of a [`Channel::SendWithAck`] command (Wi-Fi)
    AckFromSendWithAck,
    /// Acknowledgements of drone data (BLE)
    AckCommand,
    /// Acknowledgement of a [`Channel::SendWithAck`] command (BLE)
    AckCommandSent,
    /// Acknowledgement of a [`Channel::SendHighPriority`] command (BLE)
    AckHighPriority,
}

/// Wi-Fi buffer ids
pub mod buffer {
    /// Keep-alive ping from the drone
    pub const PING: u8 = 0;
    /// Keep-alive answer
    pub const PONG: u8 = 1;
    /// Commands not acknowledged
    pub const SEND_NO_ACK: u8 = 10;
    /// Acknowledged commands
    pub const SEND_WITH_ACK: u8 = 11;
    /// Low latency commands
    pub const SEND_HIGH_PRIORITY: u8 = 12;
    /// Video acknowledgements
    pub const VIDEO_ACK: u8 = 13;
    /// Video data
    pub const VIDEO_DATA: u8 = 125;
    /// Sensor data not requiring an acknowledgement
    pub const NO_ACK_DRONE_DATA: u8 = 126;
    /// Sensor data requiring an acknowledgement
    pub const ACK_DRONE_DATA: u8 = 127;
    /// Acknowledgements of acknowledged commands
    pub const ACK_FROM_SEND_WITH_ACK: u8 = 139;
}

const WIFI_CHANNELS: [(Channel, u8, Direction); 10] = [
    (Channel::Ping, buffer::PING, Direction::Receive),
    (Channel::Pong, buffer::PONG, Direction::Send),
    (Channel::SendNoAck, buffer::SEND_NO_ACK, Direction::Send),
    (Channel::SendWithAck, buffer::SEND_WITH_ACK, Direction::Send),
    (Channel::SendHighPriority, buffer::SEND_HIGH_PRIORITY, Direction::Send),
    (Channel::VideoAck, buffer::VIDEO_ACK, Direction::Send),
    (Channel::VideoData, buffer::VIDEO_DATA, Direction::Receive),
    (Channel::NoAckDroneData, buffer::NO_ACK_DRONE_DATA, Direction::Receive),
    (Channel::AckDroneData, buffer::ACK_DRONE_DATA, Direction::Receive),
    (Channel::AckFromSendWithAck, buffer::ACK_FROM_SEND_WITH_ACK, Direction::Receive),
];

const BLE_CHANNELS: [(Channel, u8, Direction); 8] = [
    (Channel::SendNoAck, 0x0a, Direction::Send),
    (Channel::SendWithAck, 0x0b, Direction::Send),
    (Channel::SendHighPriority, 0x0c, Direction::Send),
    (Channel::AckCommand, 0x1e, Direction::Send),
    (Channel::AckDroneData, 0x0e, Direction::Receive),
    (Channel::NoAckDroneData, 0x0f, Direction::Receive),
    (Channel::AckCommandSent, 0x1b, Direction::Receive),
    (Channel::AckHighPriority, 0x1c, Direction::Receive),
];

fn table(framing: Framing) -> &'static [(Channel, u8, Direction)] {
    match framing {
        Framing::Wifi => &WIFI_CHANNELS,
        Framing::Ble => &BLE_CHANNELS,
    }
}

impl Channel {
    /// Buffer or characteristic id of the channel, `None` if the transport does not have it
    pub fn id(&self, framing: Framing) -> Option<u8> {
        table(framing).iter().find(|(c, _, _)| c == self).map(|(_, id, _)| *id)
    }

    /// Channel of a buffer or characteristic id
    pub fn from_id(framing: Framing, id: u8) -> Option<Channel> {
        table(framing).iter().find(|(_, i, _)| *i == id).map(|(c, _, _)| *c)
    }

    /// Direction of the channel on a transport
    pub fn direction(&self, framing: Framing) -> Option<Direction> {
        table(framing).iter().find(|(c, _, _)| c == self).map(|(_, _, d)| *d)
    }
}

/// Wi-Fi buffer carrying the acknowledgement of frames received on `buffer_id`
pub fn wifi_ack_buffer(buffer_id: u8) -> u8 {
    buffer_id.wrapping_add(128)
}

/// Per connection channel ids and sequence counters
///
/// Counters are owned by a single context and need no locking: the sending
/// context owns one manager and the receive loop owns its own for the
/// frames it answers (pongs, acknowledgements).
#[derive(Debug)]
pub struct ChannelManager {
    framing: Framing,
    named: HashMap<Channel, u8>,
    raw: [u8; 256],
}

impl ChannelManager {
    /// Create a manager with every counter at 0
    pub fn new(framing: Framing) -> Self {
        ChannelManager { framing, named: HashMap::new(), raw: [0; 256] }
    }

    /// Framing of the transport this manager numbers frames for
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Next sequence number of a channel (increment then return, wrapping at 256)
    pub fn next_seq(&mut self, channel: Channel) -> u8 {
        let counter = self.named.entry(channel).or_insert(0);
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Next sequence number of a raw buffer id, for buffers outside of the channel table
    pub fn next_seq_for_id(&mut self, id: u8) -> u8 {
        let counter = &mut self.raw[id as usize];
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Buffer or characteristic id of a channel on this transport
    pub fn channel_id(&self, channel: Channel) -> Option<u8> {
        channel.id(self.framing)
    }

    /// `true` if frames received on `id` carry sensor data for the sensor sink
    pub fn is_data_channel(&self, id: u8) -> bool {
        matches!(
            Channel::from_id(self.framing, id),
            Some(Channel::NoAckDroneData) | Some(Channel::AckDroneData)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wraps_after_256() {
        let mut manager = ChannelManager::new(Framing::Wifi);
        let first = manager.next_seq(Channel::SendWithAck);
        assert_eq!(first, 1);
        for _ in 0..255 {
            manager.next_seq(Channel::SendWithAck);
        }
        assert_eq!(manager.next_seq(Channel::SendWithAck), first);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut manager = ChannelManager::new(Framing::Ble);
        assert_eq!(manager.next_seq(Channel::SendWithAck), 1);
        assert_eq!(manager.next_seq(Channel::SendWithAck), 2);
        assert_eq!(manager.next_seq(Channel::SendNoAck), 1);
        assert_eq!(manager.next_seq_for_id(200), 1);
    }

    #[test]
    fn test_no_sequence_reuse_below_wrap() {
        let mut manager = ChannelManager::new(Framing::Wifi);
        let seqs: Vec<u8> = (0..255).map(|_| manager.next_seq(Channel::SendWithAck)).collect();
        let mut unique = seqs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), seqs.len());
    }

    #[test]
    fn test_channel_ids() {
        let wifi = ChannelManager::new(Framing::Wifi);
        assert_eq!(wifi.channel_id(Channel::SendWithAck), Some(11));
        assert_eq!(wifi.channel_id(Channel::AckCommand), None);
        assert_eq!(Channel::from_id(Framing::Wifi, 139), Some(Channel::AckFromSendWithAck));
        assert_eq!(wifi_ack_buffer(127), 255);
        assert_eq!(wifi_ack_buffer(139), 11);

        let ble = ChannelManager::new(Framing::Ble);
        assert_eq!(ble.channel_id(Channel::AckCommand), Some(0x1e));
        assert_eq!(Channel::AckCommandSent.direction(Framing::Ble), Some(Direction::Receive));
    }

    #[test]
    fn test_data_channels() {
        let wifi = ChannelManager::new(Framing::Wifi);
        assert!(wifi.is_data_channel(126));
        assert!(wifi.is_data_channel(127));
        assert!(!wifi.is_data_channel(0));
        assert!(!wifi.is_data_channel(125));

        let ble = ChannelManager::new(Framing::Ble);
        assert!(ble.is_data_channel(0x0e));
        assert!(!ble.is_data_channel(0x1b));
    }
}
