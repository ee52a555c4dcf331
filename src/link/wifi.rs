//! # Wi-Fi link
//!
//! Connection sequence:
//! 1. Find the drone control port through a [`ServiceDiscovery`]
//! 2. Bind the local datagram socket the drone will send to
//! 3. Negotiate over TCP: we declare our receive port, the drone answers a
//!    status and the port it listens to
//! 4. Spawn the receive task
//!
//! The receive task reads datagrams with a timeout, so that it notices a
//! disconnect within one read timeout, and handles every frame packed in
//! them: pings are answered with pongs, command acknowledgements are
//! recorded and acknowledged back, sensor frames go to the sink.
//!
//! The send socket is shared by the caller and the receive task. Tokio UDP
//! sockets accept concurrent sends on `&self`; the mutex around it is only
//! there so that a failed socket can be replaced.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::{
    AckTracker, FrameWriter, Link, LinkState, RetryPolicy, SensorSink, send_with_retries, smart_sleep,
    write_with_recovery,
};
use crate::channels::{Channel, ChannelManager, buffer, wifi_ack_buffer};
use crate::codec::{DataKind, FrameHeader, Framing, build_command_packet, build_frame, split_frames};
use crate::commands::CommandDescriptor;
use crate::config::LinkConfig;
use crate::discovery::{ServiceDiscovery, discover};
use crate::error::{Error, Result};
use crate::schema::DroneFamily;

const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_SIZE: usize = 66000;
const HANDSHAKE_BUFFER_SIZE: usize = 4096;
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Drones reachable over Wi-Fi
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Airframe {
    /// Bebop
    Bebop,
    /// Bebop 2
    Bebop2,
    /// Mambo with its FPV camera
    Mambo,
}

impl Airframe {
    /// mDNS service advertised by the airframe
    pub fn service_name(&self) -> &'static str {
        match self {
            Airframe::Bebop => "_arsdk-0901._udp.local.",
            Airframe::Bebop2 => "_arsdk-090c._udp.local.",
            Airframe::Mambo => "_arsdk-090b._udp.local.",
        }
    }

    /// Schema family of the airframe
    pub fn family(&self) -> DroneFamily {
        match self {
            Airframe::Bebop | Airframe::Bebop2 => DroneFamily::ArDrone3,
            Airframe::Mambo => DroneFamily::Minidrone,
        }
    }

    /// `true` if the handshake must declare the video stream ports
    pub fn has_video_stream(&self) -> bool {
        matches!(self, Airframe::Bebop | Airframe::Bebop2)
    }
}

#[derive(Debug, Serialize)]
struct HandshakeRequest<'a> {
    d2c_port: u16,
    controller_type: &'a str,
    controller_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arstream2_client_stream_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arstream2_client_control_port: Option<u16>,
}

/// Answer of the drone to the connection request
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeResponse {
    /// 0 if the drone accepts the connection
    pub status: i32,
    /// Port the drone listens to for commands
    #[serde(default)]
    pub c2d_port: Option<u16>,
    /// Other keys of the answer (stream ports, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Parse a handshake answer, ignoring a trailing NUL
///
/// # Errors
///
/// Returns [`Error::Json`] if the answer does not parse and
/// [`Error::Handshake`] if the drone refused the connection.
pub fn parse_handshake_response(data: &[u8]) -> Result<HandshakeResponse> {
    let end = data
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    let response: HandshakeResponse = serde_json::from_slice(&data[..end])?;
    if response.status != 0 {
        return Err(Error::Handshake(format!("drone refused the connection (status {})", response.status)));
    }
    Ok(response)
}

async fn handshake(
    address: SocketAddr,
    request: &HandshakeRequest<'_>,
    num_retries: u32,
    read_timeout: Duration,
) -> Result<HandshakeResponse> {
    let mut stream = tokio::time::timeout(read_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::Handshake(format!("connection to {} timed out", address)))??;

    let request = serde_json::to_vec(request)?;
    log::debug!("Handshake request: {}", String::from_utf8_lossy(&request));
    stream.write_all(&request).await?;

    let mut data = vec![0u8; HANDSHAKE_BUFFER_SIZE];
    for attempt in 0..num_retries.max(1) {
        let n = match tokio::time::timeout(read_timeout, stream.read(&mut data)).await {
            Ok(read) => read?,
            Err(_) => {
                log::debug!("No handshake answer yet (try {}/{})", attempt + 1, num_retries);
                continue;
            }
        };
        if n == 0 {
            return Err(Error::Handshake("drone closed the handshake connection".to_string()));
        }

        let response = parse_handshake_response(&data[..n])?;
        log::debug!("Handshake response: {:?}", response);
        return Ok(response);
    }

    Err(Error::Handshake(format!("no handshake answer after {} tries", num_retries)))
}

fn unspecified(address: &IpAddr, port: u16) -> SocketAddr {
    match address {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

struct UdpWriter {
    socket: AsyncMutex<UdpSocket>,
    target: SocketAddr,
}

impl UdpWriter {
    async fn bind(target: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(unspecified(&target.ip(), 0)).await?;
        Ok(UdpWriter { socket: AsyncMutex::new(socket), target })
    }
}

#[async_trait]
impl FrameWriter for UdpWriter {
    async fn write_frame(&self, _channel: Channel, frame: &[u8]) -> Result<()> {
        self.socket.lock().await.send_to(frame, self.target).await?;
        Ok(())
    }

    async fn recover(&self) -> bool {
        match UdpSocket::bind(unspecified(&self.target.ip(), 0)).await {
            Ok(socket) => {
                log::debug!("Send socket recreated");
                *self.socket.lock().await = socket;
                true
            }
            Err(e) => {
                log::warn!("Could not recreate the send socket: {}", e);
                false
            }
        }
    }
}

struct WifiReceiver {
    socket: UdpSocket,
    writer: Arc<UdpWriter>,
    acks: AckTracker,
    sink: Arc<dyn SensorSink>,
    running: Arc<AtomicBool>,
    channels: ChannelManager,
    read_timeout: Duration,
    write_attempts: u32,
}

impl WifiReceiver {
    async fn run(mut self) {
        let mut data = vec![0u8; MAX_DATAGRAM_SIZE];
        log::debug!("Receive task started");

        while self.running.load(Ordering::Relaxed) {
            match tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut data)).await {
                Err(_) => log::trace!("Read timeout"),
                Ok(Err(e)) => {
                    log::warn!("Receive error: {}", e);
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                }
                Ok(Ok((n, _))) => self.handle_datagram(&data[..n]).await,
            }
        }

        log::debug!("Receive task stopped");
    }

    async fn handle_datagram(&mut self, datagram: &[u8]) {
        for frame in split_frames(datagram) {
            match frame {
                Ok((header, payload)) => self.handle_frame(header, payload).await,
                Err(e) => log::warn!("Dropping rest of datagram: {}", e),
            }
        }
    }

    async fn handle_frame(&mut self, header: FrameHeader, payload: &[u8]) {
        if header.channel_id == buffer::PING {
            self.send_pong(payload).await;
        }

        match header.kind() {
            Some(DataKind::Ack) => match payload.first() {
                Some(&acked) => {
                    self.acks.mark(Channel::SendWithAck, acked);
                    self.send_ack(header.channel_id, acked).await;
                }
                None => log::warn!("Empty ack frame on buffer {}", header.channel_id),
            },
            Some(DataKind::DataNoAck) => {
                if self.channels.is_data_channel(header.channel_id) {
                    self.sink.update_sensors(header.data_kind, header.channel_id, header.sequence_id, payload, false);
                }
            }
            Some(DataKind::DataWithAck) => {
                if self.channels.is_data_channel(header.channel_id) {
                    self.sink.update_sensors(header.data_kind, header.channel_id, header.sequence_id, payload, true);
                    self.send_ack(header.channel_id, header.sequence_id).await;
                }
            }
            Some(DataKind::LowLatencyData) => {
                log::debug!("Ignoring low latency data on buffer {}", header.channel_id)
            }
            None => log::warn!("Unknown data kind {} on buffer {}", header.data_kind, header.channel_id),
        }
    }

    async fn send_pong(&mut self, payload: &[u8]) {
        let seq = self.channels.next_seq(Channel::Pong);
        let frame = build_frame(Framing::Wifi, DataKind::DataNoAck, buffer::PONG, seq, payload);
        write_with_recovery(&*self.writer, Channel::Pong, &frame, self.write_attempts).await;
    }

    async fn send_ack(&mut self, buffer_id: u8, acked_seq: u8) {
        let ack_buffer = wifi_ack_buffer(buffer_id);
        let seq = self.channels.next_seq_for_id(ack_buffer);
        let frame = build_frame(Framing::Wifi, DataKind::Ack, ack_buffer, seq, &[acked_seq]);
        if !write_with_recovery(&*self.writer, Channel::AckFromSendWithAck, &frame, self.write_attempts).await {
            log::warn!("Could not acknowledge seq {} of buffer {}", acked_seq, buffer_id);
        }
    }
}

/// Link to a drone over Wi-Fi
pub struct WifiLink {
    airframe: Airframe,
    config: LinkConfig,
    discovery: Arc<dyn ServiceDiscovery>,
    discovery_interval: Duration,
    sink: Arc<dyn SensorSink>,
    state: LinkState,
    channels: ChannelManager,
    acks: AckTracker,
    running: Arc<AtomicBool>,
    writer: Option<Arc<UdpWriter>>,
    receiver: Option<JoinHandle<()>>,
    handshake: Option<HandshakeResponse>,
}

impl WifiLink {
    /// Create a disconnected link
    ///
    /// # Arguments
    /// * `airframe` - Drone type, selects the discovered service and the handshake content
    /// * `config` - Link tunables
    /// * `discovery` - Source of the drone address, [`StaticDiscovery::mambo`](crate::discovery::StaticDiscovery::mambo) for a Mambo
    /// * `sink` - Receiver of the sensor frames
    pub fn new(
        airframe: Airframe,
        config: LinkConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        sink: Arc<dyn SensorSink>,
    ) -> Self {
        WifiLink {
            airframe,
            config,
            discovery,
            discovery_interval: DISCOVERY_POLL_INTERVAL,
            sink,
            state: LinkState::Disconnected,
            channels: ChannelManager::new(Framing::Wifi),
            acks: AckTracker::new(),
            running: Arc::new(AtomicBool::new(false)),
            writer: None,
            receiver: None,
            handshake: None,
        }
    }

    /// Interval between two discovery polls, 1 s by default
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Drone type of the link
    pub fn airframe(&self) -> Airframe {
        self.airframe
    }

    /// Handshake answer of the current connection
    pub fn handshake_response(&self) -> Option<&HandshakeResponse> {
        self.handshake.as_ref()
    }

    async fn try_connect(&mut self, num_retries: u32) -> Result<()> {
        let service = discover(&*self.discovery, self.airframe.service_name(), num_retries, self.discovery_interval)
            .await
            .ok_or_else(|| {
                Error::Handshake(format!(
                    "{} not found, is this machine on the drone network?",
                    self.airframe.service_name()
                ))
            })?;

        let socket = UdpSocket::bind(unspecified(&service.address, self.config.d2c_port)).await?;
        let d2c_port = socket.local_addr()?.port();

        let video = self.airframe.has_video_stream();
        let request = HandshakeRequest {
            d2c_port,
            controller_type: &self.config.controller_type,
            controller_name: &self.config.controller_name,
            arstream2_client_stream_port: video.then_some(self.config.stream_port),
            arstream2_client_control_port: video.then_some(self.config.stream_control_port),
        };
        let response = handshake(service.socket_addr(), &request, num_retries, self.config.read_timeout()).await?;
        let c2d_port = response
            .c2d_port
            .ok_or_else(|| Error::Handshake("handshake answer without c2d_port".to_string()))?;

        let writer = Arc::new(UdpWriter::bind(SocketAddr::new(service.address, c2d_port)).await?);
        log::info!("Handshake done, receiving on {}, sending to {}:{}", d2c_port, service.address, c2d_port);

        self.running = Arc::new(AtomicBool::new(true));
        self.channels = ChannelManager::new(Framing::Wifi);
        let receiver = WifiReceiver {
            socket,
            writer: writer.clone(),
            acks: self.acks.clone(),
            sink: self.sink.clone(),
            running: self.running.clone(),
            channels: ChannelManager::new(Framing::Wifi),
            read_timeout: self.config.read_timeout(),
            write_attempts: self.config.max_packet_retries,
        };
        self.receiver = Some(tokio::spawn(receiver.run()));
        self.writer = Some(writer);
        self.handshake = Some(response);
        Ok(())
    }

    fn output(&self) -> Option<Arc<UdpWriter>> {
        match self.state {
            LinkState::Connected => self.writer.clone(),
            _ => None,
        }
    }

    async fn send_unacked(&mut self, kind: DataKind, channel: Channel, buffer_id: u8, descriptor: CommandDescriptor, params: &[u8]) {
        let Some(writer) = self.output() else {
            log::warn!("Dropping {} on a disconnected link", descriptor);
            return;
        };
        let seq = self.channels.next_seq(channel);
        let frame = build_command_packet(Framing::Wifi, kind, buffer_id, seq, descriptor, params);
        if !write_with_recovery(&*writer, channel, &frame, self.config.max_packet_retries).await {
            log::warn!("Could not send {}", descriptor);
        }
    }
}

#[async_trait]
impl Link for WifiLink {
    async fn connect(&mut self, num_retries: u32) -> bool {
        if self.state == LinkState::Connected {
            return true;
        }

        self.state = LinkState::Handshaking;
        match self.try_connect(num_retries).await {
            Ok(()) => {
                self.state = LinkState::Connected;
                log::info!("Connected to {:?} over Wi-Fi", self.airframe);
                true
            }
            Err(e) => {
                log::error!("Wi-Fi connection failed: {}", e);
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
            // the task notices the flag at its next read timeout, do not wait that long
            let abort = receiver.abort_handle();
            if tokio::time::timeout(self.config.sleep_granularity(), receiver).await.is_err() {
                abort.abort();
            }
        }
        self.writer = None;
        self.handshake = None;
        self.state = LinkState::Disconnected;
        log::info!("Disconnected from {:?}", self.airframe);
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
        let frame = build_command_packet(Framing::Wifi, DataKind::DataWithAck, buffer::SEND_WITH_ACK, seq, descriptor, params);
        let policy = RetryPolicy::from(&self.config);
        send_with_retries(&*writer, &self.acks, (Channel::SendWithAck, seq), Channel::SendWithAck, &frame, &policy, &self.running)
            .await
    }

    async fn send_no_ack(&mut self, descriptor: CommandDescriptor, params: &[u8]) {
        self.send_unacked(DataKind::DataNoAck, Channel::SendNoAck, buffer::SEND_NO_ACK, descriptor, params).await
    }

    async fn send_high_priority(&mut self, descriptor: CommandDescriptor, params: &[u8]) {
        self.send_unacked(DataKind::LowLatencyData, Channel::SendHighPriority, buffer::SEND_HIGH_PRIORITY, descriptor, params)
            .await
    }

    async fn smart_sleep(&self, duration: Duration) {
        let running = self.running.clone();
        let was_running = running.load(Ordering::Relaxed);
        smart_sleep(duration, self.config.sleep_granularity(), || was_running && !running.load(Ordering::Relaxed)).await;
    }
}

impl Drop for WifiLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}
