//! # Drone links
//!
//! A link carries command frames to the drone and runs a background receive
//! task that answers keep-alives, tracks acknowledgements and delivers
//! sensor frames to a [`SensorSink`].
//!
//! Two links share this shape: [`WifiLink`](wifi::WifiLink) over UDP and
//! [`BleLink`](ble::BleLink) over GATT characteristics. They only differ in
//! framing and in how the connection is established; the acknowledged send
//! with bounded retries below is common to both.

pub mod ble;
pub mod wifi;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::channels::Channel;
use crate::commands::CommandDescriptor;
use crate::config::LinkConfig;
use crate::error::Result;

/// Connection state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection, also the state after a failed connect
    Disconnected,
    /// Discovery and handshake in progress
    Handshaking,
    /// Receive task running, commands can be sent
    Connected,
    /// Receive task stopping
    Disconnecting,
}

/// Receiver of the sensor frames of a link
///
/// Called from the receive task for every data frame on a data channel.
/// `raw` starts with the command descriptor. When `needs_ack` is set the
/// link sends the acknowledgement itself once this call returns.
pub trait SensorSink: Send + Sync {
    /// Handle one inbound data frame
    fn update_sensors(&self, data_kind: u8, channel_id: u8, sequence_id: u8, raw: &[u8], needs_ack: bool);
}

/// Command transport to one drone
#[async_trait]
pub trait Link: Send + Sync {
    /// Connect to the drone
    ///
    /// # Arguments
    /// * `num_retries` - Bound of the discovery and handshake attempts
    ///
    /// # Returns
    /// `true` once the receive task runs, `false` with a logged reason otherwise
    async fn connect(&mut self, num_retries: u32) -> bool;

    /// Stop the receive task and release the transport
    ///
    /// Safe to call at any time, including after a failed connect.
    async fn disconnect(&mut self);

    /// Current connection state
    fn state(&self) -> LinkState;

    /// Send a command on the acknowledged channel
    ///
    /// # Returns
    /// `true` if the drone acknowledged the command. `false` means the outcome
    /// is unknown: the command may have been executed with its ack lost.
    async fn send_with_ack(&mut self, descriptor: CommandDescriptor, params: &[u8]) -> bool;

    /// Send a command on the non acknowledged channel
    async fn send_no_ack(&mut self, descriptor: CommandDescriptor, params: &[u8]);

    /// Send a command on the high priority channel
    async fn send_high_priority(&mut self, descriptor: CommandDescriptor, params: &[u8]);

    /// Sleep while the receive task keeps processing frames
    ///
    /// Returns early if the link gets disconnected meanwhile.
    async fn smart_sleep(&self, duration: Duration);
}

/// Received flags of the pending acknowledgements
///
/// Shared between the sending context, which resets and reads the flags,
/// and the receive task, which sets them.
#[derive(Debug, Clone, Default)]
pub struct AckTracker {
    inner: Arc<Mutex<HashMap<(Channel, u8), bool>>>,
}

impl AckTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the flag of a sequence number before sending it
    pub fn reset(&self, channel: Channel, seq: u8) {
        self.inner.lock().insert((channel, seq), false);
    }

    /// An acknowledgement for `seq` arrived
    pub fn mark(&self, channel: Channel, seq: u8) {
        self.inner.lock().insert((channel, seq), true);
    }

    /// An acknowledgement without sequence number arrived, confirm every pending send
    pub fn mark_all(&self, channel: Channel) {
        for (key, received) in self.inner.lock().iter_mut() {
            if key.0 == channel {
                *received = true;
            }
        }
    }

    /// `true` if the acknowledgement of `seq` arrived since its last reset
    pub fn is_received(&self, channel: Channel, seq: u8) -> bool {
        self.inner.lock().get(&(channel, seq)).copied().unwrap_or(false)
    }
}

/// Retry budget of an acknowledged send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of transmissions
    pub max_packet_retries: u32,
    /// Wait for the acknowledgement after each transmission
    pub ack_wait: Duration,
    /// Slice of the cooperative wait
    pub granularity: Duration,
}

impl From<&LinkConfig> for RetryPolicy {
    fn from(config: &LinkConfig) -> Self {
        RetryPolicy {
            max_packet_retries: config.max_packet_retries,
            ack_wait: config.ack_wait(),
            granularity: config.sleep_granularity(),
        }
    }
}

/// Frame output of a link, shared by the sending context and the receive task
#[async_trait]
pub(crate) trait FrameWriter: Send + Sync {
    /// Write one frame on a channel
    async fn write_frame(&self, channel: Channel, frame: &[u8]) -> Result<()>;

    /// Restore the output after a failed write, `false` if that failed as well
    async fn recover(&self) -> bool;
}

/// Sleep `duration` in `granularity` slices, returns `true` as soon as `stop` holds
///
/// The receive task runs on its own, this only yields to it.
pub async fn smart_sleep(duration: Duration, granularity: Duration, mut stop: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(granularity.min(deadline - now)).await;
    }
}

/// Write a frame, recovering the output after failed writes
///
/// # Returns
/// `true` if the frame was written within `attempts` tries
pub(crate) async fn write_with_recovery(writer: &dyn FrameWriter, channel: Channel, frame: &[u8], attempts: u32) -> bool {
    for attempt in 0..attempts.max(1) {
        match writer.write_frame(channel, frame).await {
            Ok(()) => return true,
            Err(e) => {
                log::debug!("Write on {:?} failed (attempt {}): {}", channel, attempt + 1, e);
                if !writer.recover().await {
                    return false;
                }
            }
        }
    }
    false
}

/// Send a frame until its acknowledgement arrives or the retry budget is spent
///
/// Every retry resends the identical frame, same sequence number included.
/// A failed write counts as an attempt and recovers the output first.
pub(crate) async fn send_with_retries(
    writer: &dyn FrameWriter,
    tracker: &AckTracker,
    ack_key: (Channel, u8),
    channel: Channel,
    frame: &[u8],
    policy: &RetryPolicy,
    running: &AtomicBool,
) -> bool {
    let (ack_channel, seq) = ack_key;
    tracker.reset(ack_channel, seq);

    for attempt in 0..policy.max_packet_retries {
        if let Err(e) = writer.write_frame(channel, frame).await {
            log::debug!("Send of seq {} failed on try {}: {}", seq, attempt + 1, e);
            if !writer.recover().await {
                log::warn!("Could not restore the link output");
            }
            continue;
        }

        smart_sleep(policy.ack_wait, policy.granularity, || {
            tracker.is_received(ack_channel, seq) || !running.load(Ordering::Relaxed)
        })
        .await;

        if tracker.is_received(ack_channel, seq) {
            return true;
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }
        log::debug!("No ack for seq {} after try {}/{}", seq, attempt + 1, policy.max_packet_retries);
    }

    tracker.is_received(ack_channel, seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicU32;

    // Writer acking on the nth write and failing the writes listed in `failures`
    struct ScriptedWriter {
        tracker: AckTracker,
        ack_on: Option<u32>,
        failures: Vec<u32>,
        writes: AtomicU32,
        recoveries: AtomicU32,
    }

    impl ScriptedWriter {
        fn new(tracker: AckTracker, ack_on: Option<u32>) -> Self {
            ScriptedWriter { tracker, ack_on, failures: Vec::new(), writes: AtomicU32::new(0), recoveries: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl FrameWriter for ScriptedWriter {
        async fn write_frame(&self, _channel: Channel, frame: &[u8]) -> Result<()> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failures.contains(&n) {
                return Err(Error::TransportIo(std::io::Error::other("scripted failure")));
            }
            if self.ack_on == Some(n) {
                self.tracker.mark(Channel::SendWithAck, frame[2]);
            }
            Ok(())
        }

        async fn recover(&self) -> bool {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_packet_retries: retries,
            ack_wait: Duration::from_millis(30),
            granularity: Duration::from_millis(5),
        }
    }

    const FRAME: [u8; 11] = [4, 11, 7, 11, 0, 0, 0, 2, 0, 1, 0];

    #[tokio::test]
    async fn test_ack_on_third_try() {
        let tracker = AckTracker::new();
        let writer = ScriptedWriter::new(tracker.clone(), Some(3));
        let running = AtomicBool::new(true);

        let acked =
            send_with_retries(&writer, &tracker, (Channel::SendWithAck, 7), Channel::SendWithAck, &FRAME, &policy(5), &running)
                .await;
        assert!(acked);
        assert_eq!(writer.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_ack_exhausts_budget() {
        let tracker = AckTracker::new();
        let writer = ScriptedWriter::new(tracker.clone(), None);
        let running = AtomicBool::new(true);

        let acked =
            send_with_retries(&writer, &tracker, (Channel::SendWithAck, 7), Channel::SendWithAck, &FRAME, &policy(4), &running)
                .await;
        assert!(!acked);
        assert_eq!(writer.writes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_io_error_counts_as_attempt() {
        let tracker = AckTracker::new();
        let mut writer = ScriptedWriter::new(tracker.clone(), Some(2));
        writer.failures = vec![1];
        let running = AtomicBool::new(true);

        let acked =
            send_with_retries(&writer, &tracker, (Channel::SendWithAck, 7), Channel::SendWithAck, &FRAME, &policy(2), &running)
                .await;
        assert!(acked);
        assert_eq!(writer.recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_ack_is_cleared() {
        let tracker = AckTracker::new();
        tracker.mark(Channel::SendWithAck, 7);
        let writer = ScriptedWriter::new(tracker.clone(), None);
        let running = AtomicBool::new(true);

        let acked =
            send_with_retries(&writer, &tracker, (Channel::SendWithAck, 7), Channel::SendWithAck, &FRAME, &policy(1), &running)
                .await;
        assert!(!acked);
    }

    #[tokio::test]
    async fn test_disconnect_stops_waiting() {
        let tracker = AckTracker::new();
        let writer = ScriptedWriter::new(tracker.clone(), None);
        let running = AtomicBool::new(false);
        let slow = RetryPolicy { max_packet_retries: 3, ack_wait: Duration::from_secs(10), granularity: Duration::from_millis(5) };

        let start = Instant::now();
        let acked =
            send_with_retries(&writer, &tracker, (Channel::SendWithAck, 1), Channel::SendWithAck, &FRAME, &slow, &running).await;
        assert!(!acked);
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_mark_all() {
        let tracker = AckTracker::new();
        tracker.reset(Channel::SendWithAck, 1);
        tracker.reset(Channel::SendWithAck, 2);
        tracker.reset(Channel::SendHighPriority, 1);
        tracker.mark_all(Channel::SendWithAck);
        assert!(tracker.is_received(Channel::SendWithAck, 1));
        assert!(tracker.is_received(Channel::SendWithAck, 2));
        assert!(!tracker.is_received(Channel::SendHighPriority, 1));
    }

    #[tokio::test]
    async fn test_smart_sleep_stops_early() {
        let start = Instant::now();
        let mut polls = 0;
        let stopped = smart_sleep(Duration::from_secs(5), Duration::from_millis(5), || {
            polls += 1;
            polls > 3
        })
        .await;
        assert!(stopped);
        assert!(start.elapsed() < Duration::from_secs(1));

        let stopped = smart_sleep(Duration::from_millis(20), Duration::from_millis(5), || false).await;
        assert!(!stopped);
    }
}
