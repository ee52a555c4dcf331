//! # BLE link
//!
//! Commands are written to the `fa00` service characteristics, sensor data
//! and command acknowledgements come back as notifications on the `fb00`
//! service. The GATT stack itself is an external [`GattLink`]: this module
//! only needs characteristic discovery, writes and a notification stream.
//!
//! Once every characteristic is found the link enables the notifications
//! by writing `0x0001` to the configuration descriptor of ten fixed
//! characteristics. The drone does not talk until this is done.
//!
//! GATT stacks do not accept concurrent writes, so every write of the link
//! and of its receive task goes through one async mutex. A failed write
//! reconnects the device and repeats the notification handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::{
    AckTracker, FrameWriter, Link, LinkState, RetryPolicy, SensorSink, send_with_retries, smart_sleep,
    write_with_recovery,
};
use crate::channels::{Channel, ChannelManager, Direction};
use crate::codec::{DataKind, Framing, build_command_packet, build_frame, decode_ble_header};
use crate::commands::CommandDescriptor;
use crate::config::LinkConfig;
use crate::error::{Error, Result};

/// Service of the command characteristics
pub const SEND_SERVICE: u16 = 0xfa00;
/// Service of the notification characteristics
pub const RECEIVE_SERVICE: u16 = 0xfb00;

/// Characteristics whose notifications must be enabled
pub const HANDSHAKE_CHARACTERISTICS: [u16; 10] =
    [0xfb0f, 0xfb0e, 0xfb1b, 0xfb1c, 0xfd22, 0xfd23, 0xfd24, 0xfd52, 0xfd53, 0xfd54];

// Value written to enable the notifications of a characteristic
const ENABLE_NOTIFICATIONS: [u8; 2] = [1, 0];

// Offset from the characteristic handle to its configuration descriptor
const CONFIGURATION_HANDLE_OFFSET: u16 = 2;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    /// 16 bits UUID, `0xfa0b` for instance
    pub uuid: u16,
    /// Value handle
    pub handle: u16,
}

/// A notification received from the drone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Value handle of the notifying characteristic
    pub handle: u16,
    /// Notified value
    pub data: Vec<u8>,
}

/// GATT client of one device
///
/// Every method takes `&self`: the link writes while its receive task waits
/// for notifications.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Connect to the device
    async fn connect(&self) -> Result<()>;

    /// List the characteristics of the device
    async fn discover(&self) -> Result<Vec<Characteristic>>;

    /// Write a value to a handle
    async fn write(&self, handle: u16, data: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next notification
    async fn next_notification(&self, timeout: Duration) -> Result<Option<Notification>>;

    /// Disconnect from the device
    async fn disconnect(&self) -> Result<()>;
}

/// UUID of the characteristic of a channel
pub fn characteristic_uuid(channel: Channel) -> Option<u16> {
    let id = channel.id(Framing::Ble)? as u16;
    match channel.direction(Framing::Ble)? {
        Direction::Send => Some(SEND_SERVICE | id),
        Direction::Receive => Some(RECEIVE_SERVICE | id),
    }
}

const SEND_CHANNELS: [Channel; 4] =
    [Channel::SendNoAck, Channel::SendWithAck, Channel::SendHighPriority, Channel::AckCommand];
const RECEIVE_CHANNELS: [Channel; 4] =
    [Channel::AckDroneData, Channel::NoAckDroneData, Channel::AckCommandSent, Channel::AckHighPriority];

/// Characteristic handles of a connection
#[derive(Debug, Clone, Default)]
struct HandleMap {
    send: HashMap<Channel, u16>,
    receive: HashMap<u16, Channel>,
    handshake: Vec<u16>,
}

impl HandleMap {
    // `None` until every channel and handshake characteristic is present
    fn from_characteristics(characteristics: &[Characteristic]) -> Option<Self> {
        let handle_of = |uuid: u16| characteristics.iter().find(|c| c.uuid == uuid).map(|c| c.handle);

        let mut map = HandleMap::default();
        for channel in SEND_CHANNELS {
            map.send.insert(channel, handle_of(characteristic_uuid(channel)?)?);
        }
        for channel in RECEIVE_CHANNELS {
            map.receive.insert(handle_of(characteristic_uuid(channel)?)?, channel);
        }
        for uuid in HANDSHAKE_CHARACTERISTICS {
            map.handshake.push(handle_of(uuid)?);
        }
        Some(map)
    }
}

struct GattWriter {
    gatt: Arc<dyn GattLink>,
    handles: HandleMap,
    lock: AsyncMutex<()>,
    reconnect_retries: u32,
}

impl GattWriter {
    async fn magic_handshake(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for handle in &self.handles.handshake {
            self.gatt.write(handle + CONFIGURATION_HANDLE_OFFSET, &ENABLE_NOTIFICATIONS).await?;
        }
        log::debug!("Notifications enabled on {} characteristics", self.handles.handshake.len());
        Ok(())
    }

    async fn try_reconnect(&self) -> Result<()> {
        // a failed disconnect means we already lost the device
        if let Err(e) = self.gatt.disconnect().await {
            log::debug!("Disconnect before reconnect failed: {}", e);
        }
        self.gatt.connect().await?;
        self.magic_handshake().await
    }
}

#[async_trait]
impl FrameWriter for GattWriter {
    async fn write_frame(&self, channel: Channel, frame: &[u8]) -> Result<()> {
        let handle = self
            .handles
            .send
            .get(&channel)
            .copied()
            .ok_or_else(|| Error::Gatt(format!("no characteristic for {:?}", channel)))?;
        let _guard = self.lock.lock().await;
        self.gatt.write(handle, frame).await
    }

    async fn recover(&self) -> bool {
        for attempt in 0..self.reconnect_retries {
            match self.try_reconnect().await {
                Ok(()) => {
                    log::info!("Reconnected after {} tries", attempt + 1);
                    return true;
                }
                Err(e) => log::debug!("Reconnect try {}/{} failed: {}", attempt + 1, self.reconnect_retries, e),
            }
        }
        log::warn!("Could not reconnect to the drone");
        false
    }
}

struct BleReceiver {
    gatt: Arc<dyn GattLink>,
    writer: Arc<GattWriter>,
    acks: AckTracker,
    sink: Arc<dyn SensorSink>,
    running: Arc<AtomicBool>,
    channels: ChannelManager,
    read_timeout: Duration,
    write_attempts: u32,
}

impl BleReceiver {
    async fn run(mut self) {
        log::debug!("Notification task started");

        while self.running.load(Ordering::Relaxed) {
            match self.gatt.next_notification(self.read_timeout).await {
                Ok(None) => log::trace!("Notification timeout"),
                Ok(Some(notification)) => self.handle_notification(notification).await,
                Err(e) => {
                    log::warn!("Notification error: {}", e);
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                }
            }
        }

        log::debug!("Notification task stopped");
    }

    async fn handle_notification(&mut self, notification: Notification) {
        let Some(channel) = self.writer.handles.receive.get(&notification.handle).copied() else {
            log::trace!("Notification on unmapped handle {:#06x}", notification.handle);
            return;
        };

        let (header, payload) = match decode_ble_header(&notification.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping notification on {:?}: {}", channel, e);
                return;
            }
        };
        let channel_id = channel.id(Framing::Ble).unwrap_or_default();

        match channel {
            Channel::AckDroneData => {
                self.sink.update_sensors(header.packet_type, channel_id, header.sequence_id, payload, true);
                self.send_ack(header.sequence_id).await;
            }
            Channel::NoAckDroneData => {
                self.sink.update_sensors(header.packet_type, channel_id, header.sequence_id, payload, false)
            }
            Channel::AckCommandSent => self.mark(Channel::SendWithAck, payload),
            Channel::AckHighPriority => self.mark(Channel::SendHighPriority, payload),
            _ => log::trace!("Ignoring notification on {:?}", channel),
        }
    }

    fn mark(&self, channel: Channel, payload: &[u8]) {
        match payload.first() {
            Some(&seq) => self.acks.mark(channel, seq),
            None => self.acks.mark_all(channel),
        }
    }

    async fn send_ack(&mut self, acked_seq: u8) {
        let seq = self.channels.next_seq(Channel::AckCommand);
        let frame = build_frame(Framing::Ble, DataKind::Ack, 0, seq, &[acked_seq]);
        if !write_with_recovery(&*self.writer, Channel::AckCommand, &frame, self.write_attempts).await {
            log::warn!("Could not acknowledge drone data seq {}", acked_seq);
        }
    }
}

/// Link to a drone over BLE
pub struct BleLink {
    gatt: Arc<dyn GattLink>,
    config: LinkConfig,
    sink: Arc<dyn SensorSink>,
    state: LinkState,
    channels: ChannelManager,
    acks: AckTracker,
    running: Arc<AtomicBool>,
    writer: Option<Arc<GattWriter>>,
    receiver: Option<JoinHandle<()>>,
}

impl BleLink {
    /// Create a disconnected link
    ///
    /// # Arguments
    /// * `gatt` - GATT client of the drone
    /// * `config` - Link tunables, see [`LinkConfig::ble_defaults`]
    /// * `sink` - Receiver of the sensor frames
    pub fn new(gatt: Arc<dyn GattLink>, config: LinkConfig, sink: Arc<dyn SensorSink>) -> Self {
        BleLink {
            gatt,
            config,
            sink,
            state: LinkState::Disconnected,
            channels: ChannelManager::new(Framing::Ble),
            acks: AckTracker::new(),
            running: Arc::new(AtomicBool::new(false)),
            writer: None,
            receiver: None,
        }
    }

    async fn open_gatt(&self, num_retries: u32) -> Result<HandleMap> {
        let attempts = num_retries.max(1);
        for attempt in 0..attempts {
            match self.try_open_gatt().await {
                Ok(Some(handles)) => return Ok(handles),
                Ok(None) => log::debug!("Some characteristics are missing (try {}/{})", attempt + 1, attempts),
                Err(e) => log::warn!("BLE connect attempt {}/{} failed: {}", attempt + 1, attempts, e),
            }
            tokio::time::sleep(self.config.sleep_granularity()).await;
        }
        Err(Error::Gatt(format!("no usable GATT connection after {} attempts", attempts)))
    }

    async fn try_open_gatt(&self) -> Result<Option<HandleMap>> {
        self.gatt.connect().await?;
        let characteristics = self.gatt.discover().await?;
        Ok(HandleMap::from_characteristics(&characteristics))
    }

    async fn try_connect(&mut self, num_retries: u32) -> Result<()> {
        let handles = self.open_gatt(num_retries).await?;

        let writer = Arc::new(GattWriter {
            gatt: self.gatt.clone(),
            handles,
            lock: AsyncMutex::new(()),
            reconnect_retries: self.config.reconnect_retries,
        });
        writer.magic_handshake().await?;

        self.running = Arc::new(AtomicBool::new(true));
        self.channels = ChannelManager::new(Framing::Ble);
        let receiver = BleReceiver {
            gatt: self.gatt.clone(),
            writer: writer.clone(),
            acks: self.acks.clone(),
            sink: self.sink.clone(),
            running: self.running.clone(),
            channels: ChannelManager::new(Framing::Ble),
            read_timeout: self.config.sleep_granularity(),
            write_attempts: self.config.max_packet_retries,
        };
        self.receiver = Some(tokio::spawn(receiver.run()));
        self.writer = Some(writer);
        Ok(())
    }

    fn output(&self) -> Option<Arc<GattWriter>> {
        match self.state {
            LinkState::Connected => self.writer.clone(),
            _ => None,
        }
    }
}

#[async_trait]
impl Link for BleLink {
    async fn connect(&mut self, num_retries: u32) -> bool {
        if self.state == LinkState::Connected {
            return true;
        }

        self.state = LinkState::Handshaking;
        match self.try_connect(num_retries).await {
            Ok(()) => {
                self.state = LinkState::Connected;
                log::info!("Connected over BLE");
                true
            }
            Err(e) => {
                log::error!("BLE connection failed: {}", e);
                self.disconnect().await;
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.state == LinkState::Disconnected && self.receiver.is_none() {
            return;
        }

        self.state = LinkState::Disconnecting;
        self.running.store(false, Ordering::Relaxed);
        if let Some(receiver) = self.receiver.take() {
            let abort = receiver.abort_handle();
            if tokio::time::timeout(self.config.sleep_granularity(), receiver).await.is_err() {
                abort.abort();
            }
        }
        self.writer = None;
        if let Err(e) = self.gatt.disconnect().await {
            log::debug!("GATT disconnect failed: {}", e);
        }
        self.state = LinkState::Disconnected;
        log::info!("Disconnected from BLE drone");
    }

    fn state(&self) -> LinkState {
        self.state
    }

    async fn send_with_ack(&mut self, descriptor: CommandDescriptor, params: &[u8]) -> bool {
        let Some(writer) = self.output() else {
            log::warn!("Cannot send {} on a disconnected link", descriptor);
            return false;
        };

        let seq = self.channels.next_seq(Channel::SendWithAck);
        let frame = build_command_packet(Framing::Ble, DataKind::DataWithAck, 0, seq, descriptor, params);
        let policy = RetryPolicy::from(&self.config);
        send_with_retries(&*writer, &self.acks, (Channel::SendWithAck, seq), Channel::SendWithAck, &frame, &policy, &self.running)
            .await
    }

    async fn send_no_ack(&mut self, descriptor: CommandDescriptor, params: &[u8]) {
        let Some(writer) = self.output() else {
            log::warn!("Dropping {} on a disconnected link", descriptor);
            return;
        };
        let seq = self.channels.next_seq(Channel::SendNoAck);
        let frame = build_command_packet(Framing::Ble, DataKind::DataNoAck, 0, seq, descriptor, params);
        if !write_with_recovery(&*writer, Channel::SendNoAck, &frame, self.config.max_packet_retries).await {
            log::warn!("Could not send {}", descriptor);
        }
    }

    async fn send_high_priority(&mut self, descriptor: CommandDescriptor, params: &[u8]) {
        let Some(writer) = self.output() else {
            log::warn!("Dropping {} on a disconnected link", descriptor);
            return;
        };
        let seq = self.channels.next_seq(Channel::SendHighPriority);
        let frame = build_command_packet(Framing::Ble, DataKind::LowLatencyData, 0, seq, descriptor, params);
        if !write_with_recovery(&*writer, Channel::SendHighPriority, &frame, self.config.max_packet_retries).await {
            log::warn!("Could not send {}", descriptor);
        }
    }

    async fn smart_sleep(&self, duration: Duration) {
        let running = self.running.clone();
        let was_running = running.load(Ordering::Relaxed);
        smart_sleep(duration, self.config.sleep_granularity(), || was_running && !running.load(Ordering::Relaxed)).await;
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}
