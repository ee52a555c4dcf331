//! # Drone
//!
//! [`Drone`] ties one link to the command table and the sensor hub of the
//! connection, and offers commands by name plus the usual piloting
//! commands. Acknowledged commands return `Ok(false)` when the drone did
//! not confirm them in time: the command may or may not have run.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::codec::{Framing, Value, encode_params};
use crate::commands::{CommandDescriptor, CommandTable};
use crate::config::LinkConfig;
use crate::discovery::{ServiceDiscovery, StaticDiscovery};
use crate::error::{Error, Result};
use crate::link::ble::{BleLink, GattLink};
use crate::link::wifi::{Airframe, WifiLink};
use crate::link::{Link, LinkState, SensorSink};
use crate::resolver::SensorSchemaResolver;
use crate::schema::{COMMON_PROJECT, DroneFamily, SchemaCatalog};
use crate::state::{SensorHub, SensorObserver, SensorState};

/// Interval between two PCMD of a timed [`Drone::fly_direct`]
pub const PCMD_INTERVAL: Duration = Duration::from_millis(100);

const FLY_COMMAND_LIMIT: i64 = 100;
const TURN_LIMIT_DEGREES: i64 = 180;
const SAFE_COMMAND_INTERVAL: Duration = Duration::from_secs(1);

/// A connected (or connectable) drone
pub struct Drone {
    link: Box<dyn Link>,
    framing: Framing,
    commands: CommandTable,
    hub: Arc<SensorHub>,
}

impl Drone {
    /// Build a drone around a link
    ///
    /// # Arguments
    /// * `catalog` - Schema catalog shared by the command table and the sensor decoder
    /// * `family` - Drone family, selects the command project
    /// * `framing` - Transport of the link
    /// * `build_link` - Builds the link, given the sensor sink it must deliver to
    pub fn with_link(
        catalog: Arc<SchemaCatalog>,
        family: DroneFamily,
        framing: Framing,
        build_link: impl FnOnce(Arc<dyn SensorSink>) -> Box<dyn Link>,
    ) -> Self {
        let hub = Arc::new(SensorHub::new(SensorSchemaResolver::new(catalog.clone(), family), family));
        let link = build_link(hub.clone());
        Drone { link, framing, commands: CommandTable::new(catalog, family), hub }
    }

    /// Drone reachable over Wi-Fi
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in schema does not load.
    pub fn wifi(airframe: Airframe, config: LinkConfig, discovery: Arc<dyn ServiceDiscovery>) -> Result<Self> {
        let catalog = Arc::new(SchemaCatalog::builtin()?);
        Ok(Self::with_link(catalog, airframe.family(), Framing::Wifi, |sink| {
            Box::new(WifiLink::new(airframe, config, discovery, sink))
        }))
    }

    /// Mambo reachable over the Wi-Fi of its FPV camera, at its fixed address
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in schema does not load.
    pub fn mambo_wifi(config: LinkConfig) -> Result<Self> {
        Self::wifi(Airframe::Mambo, config, Arc::new(StaticDiscovery::mambo()))
    }

    /// Mambo or Swing reachable over BLE
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in schema does not load.
    pub fn ble(gatt: Arc<dyn GattLink>, config: LinkConfig) -> Result<Self> {
        let catalog = Arc::new(SchemaCatalog::builtin()?);
        Ok(Self::with_link(catalog, DroneFamily::Minidrone, Framing::Ble, |sink| {
            Box::new(BleLink::new(gatt, config, sink))
        }))
    }

    /// Drone family
    pub fn family(&self) -> DroneFamily {
        self.commands.family()
    }

    /// Connect to the drone
    ///
    /// # Returns
    /// `true` if the link is up, the reason of a failure is logged
    pub async fn connect(&mut self, num_retries: u32) -> bool {
        self.link.connect(num_retries).await
    }

    /// Disconnect from the drone, does nothing if not connected
    pub async fn disconnect(&mut self) {
        self.link.disconnect().await
    }

    /// Connection state
    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    /// Sleep while the link keeps receiving
    pub async fn smart_sleep(&self, duration: Duration) {
        self.link.smart_sleep(duration).await
    }

    /// Copy of the current sensor state
    pub fn sensors(&self) -> SensorState {
        self.hub.snapshot()
    }

    /// Register (or clear) the callback called on every sensor update
    pub fn set_observer(&self, observer: Option<Arc<dyn SensorObserver>>) {
        self.hub.set_observer(observer)
    }

    /// `true` when landed or in emergency
    pub fn is_landed(&self) -> bool {
        self.hub.with_state(|s| s.is_landed())
    }

    fn flying_state(&self) -> String {
        self.hub.with_state(|s| s.flying_state.clone())
    }

    fn encode(&self, project: &str, class: &str, command: &str, args: &[Value]) -> Result<(CommandDescriptor, Vec<u8>)> {
        let descriptor = self.commands.resolve(project, class, command)?;
        let types = self.commands.arg_types(project, class, command)?;
        Ok((descriptor, encode_params(args, &types)?))
    }

    /// Send a command on the acknowledged channel
    ///
    /// # Arguments
    /// * `project` - `common` or the family project (`minidrone`, `ardrone3`)
    /// * `class` - Class name
    /// * `command` - Command name
    /// * `args` - Arguments in declaration order, enums by index or by name
    ///
    /// # Returns
    /// `Ok(true)` once the drone acknowledged the command
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the command is unknown and
    /// [`Error::InvalidParameter`] if the arguments do not match it.
    pub async fn send_with_ack(&mut self, project: &str, class: &str, command: &str, args: &[Value]) -> Result<bool> {
        let (descriptor, params) = self.encode(project, class, command, args)?;
        Ok(self.link.send_with_ack(descriptor, &params).await)
    }

    /// Send a command on the unacknowledged channel
    ///
    /// # Errors
    ///
    /// Same as [`Drone::send_with_ack`].
    pub async fn send_no_ack(&mut self, project: &str, class: &str, command: &str, args: &[Value]) -> Result<()> {
        let (descriptor, params) = self.encode(project, class, command, args)?;
        self.link.send_no_ack(descriptor, &params).await;
        Ok(())
    }

    /// Send a command on the high priority channel
    ///
    /// # Errors
    ///
    /// Same as [`Drone::send_with_ack`].
    pub async fn send_high_priority(&mut self, project: &str, class: &str, command: &str, args: &[Value]) -> Result<()> {
        let (descriptor, params) = self.encode(project, class, command, args)?;
        self.link.send_high_priority(descriptor, &params).await;
        Ok(())
    }

    // Acknowledged command ending with the enum `value`, after `leading` arguments
    async fn send_enum(&mut self, class: &str, command: &str, leading: &[Value], value: &str) -> Result<bool> {
        let project = self.family().project_name();
        let (descriptor, index) = self.commands.resolve_with_enum(project, class, command, value)?;
        let types = self.commands.arg_types(project, class, command)?;

        let mut args = leading.to_vec();
        args.push(Value::Enum(index));
        let params = encode_params(&args, &types)?;
        Ok(self.link.send_with_ack(descriptor, &params).await)
    }

    fn require_family(&self, family: DroneFamily, what: &str) -> Result<()> {
        if self.family() != family {
            return Err(Error::Configuration(format!("{} is not available on {:?} drones", what, self.family())));
        }
        Ok(())
    }

    /// Take off
    pub async fn takeoff(&mut self) -> Result<bool> {
        let project = self.family().project_name();
        self.send_with_ack(project, "Piloting", "TakeOff", &[]).await
    }

    /// Send takeoff until the drone reports taking off, then wait until it flies
    ///
    /// # Returns
    /// `Ok(true)` if the drone is flying or hovering before `timeout`
    pub async fn safe_takeoff(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        while self.flying_state() == "landed" && start.elapsed() < timeout {
            self.takeoff().await?;
            self.smart_sleep(SAFE_COMMAND_INTERVAL).await;
        }
        while !matches!(self.flying_state().as_str(), "flying" | "hovering") && start.elapsed() < timeout {
            if self.flying_state() == "emergency" {
                return Ok(false);
            }
            self.smart_sleep(SAFE_COMMAND_INTERVAL).await;
        }
        Ok(matches!(self.flying_state().as_str(), "flying" | "hovering"))
    }

    /// Land
    pub async fn land(&mut self) -> Result<bool> {
        let project = self.family().project_name();
        self.send_with_ack(project, "Piloting", "Landing", &[]).await
    }

    /// Land on the high priority channel
    pub async fn emergency_land(&mut self) -> Result<()> {
        let project = self.family().project_name();
        self.send_high_priority(project, "Piloting", "Landing", &[]).await
    }

    /// Send land until the drone reports landing, then wait until it is landed
    ///
    /// # Returns
    /// `Ok(true)` if the drone is landed before `timeout`
    pub async fn safe_land(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        while !matches!(self.flying_state().as_str(), "landing" | "landed") && start.elapsed() < timeout {
            if self.flying_state() == "emergency" {
                return Ok(false);
            }
            log::info!("Trying to land");
            self.land().await?;
            self.smart_sleep(SAFE_COMMAND_INTERVAL).await;
        }
        while self.flying_state() != "landed" && start.elapsed() < timeout {
            self.smart_sleep(SAFE_COMMAND_INTERVAL).await;
        }
        Ok(self.flying_state() == "landed")
    }

    /// Cut the motors
    pub async fn emergency(&mut self) -> Result<bool> {
        let project = self.family().project_name();
        self.send_with_ack(project, "Piloting", "Emergency", &[]).await
    }

    /// Send emergency while the drone flies, then wait until it is landed
    pub async fn safe_emergency(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        while matches!(self.flying_state().as_str(), "flying" | "hovering") && start.elapsed() < timeout {
            self.emergency().await?;
            self.smart_sleep(SAFE_COMMAND_INTERVAL).await;
        }
        while self.flying_state() != "landed" && start.elapsed() < timeout {
            self.smart_sleep(SAFE_COMMAND_INTERVAL).await;
        }
        Ok(self.flying_state() == "landed")
    }

    /// Calibrate the horizontal reference, drone on a flat surface
    pub async fn flat_trim(&mut self) -> Result<bool> {
        let project = self.family().project_name();
        self.send_with_ack(project, "Piloting", "FlatTrim", &[]).await
    }

    /// Hold position (minidrone), sent as a flat trim
    pub async fn hover(&mut self) -> Result<bool> {
        self.require_family(DroneFamily::Minidrone, "hover")?;
        self.send_with_ack(DroneFamily::Minidrone.project_name(), "Piloting", "FlatTrim", &[]).await
    }

    /// Flip in a direction: `front`, `back`, `right` or `left`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for any other direction.
    pub async fn flip(&mut self, direction: &str) -> Result<bool> {
        self.send_enum("Animations", "Flip", &[], &direction.to_lowercase()).await
    }

    /// Turn in place, clamped to -180..=180 degrees (minidrone)
    pub async fn turn_degrees(&mut self, degrees: i64) -> Result<bool> {
        self.require_family(DroneFamily::Minidrone, "turn_degrees")?;
        let degrees = degrees.clamp(-TURN_LIMIT_DEGREES, TURN_LIMIT_DEGREES) as i16;
        self.send_with_ack(DroneFamily::Minidrone.project_name(), "Animations", "Cap", &[Value::I16(degrees)]).await
    }

    /// Ask the drone to send every state
    pub async fn ask_for_state_update(&mut self) -> Result<bool> {
        self.send_with_ack(COMMON_PROJECT, "Common", "AllStates", &[]).await
    }

    /// Fly with piloting speeds, each in -100..=100 and clamped to it
    ///
    /// # Arguments
    /// * `roll`, `pitch`, `yaw`, `vertical` - Piloting speeds in percent
    /// * `duration` - `None` to send one command, else repeat it every 100 ms for that long
    pub async fn fly_direct(
        &mut self,
        roll: i64,
        pitch: i64,
        yaw: i64,
        vertical: i64,
        duration: Option<Duration>,
    ) -> Result<()> {
        let project = self.family().project_name();
        let speed = |v: i64| Value::I8(v.clamp(-FLY_COMMAND_LIMIT, FLY_COMMAND_LIMIT) as i8);
        let args = [Value::U8(1), speed(roll), speed(pitch), speed(yaw), speed(vertical), Value::U32(0)];
        let (descriptor, params) = self.encode(project, "Piloting", "PCMD", &args)?;

        let Some(duration) = duration else {
            self.link.send_no_ack(descriptor, &params).await;
            return Ok(());
        };

        let start = Instant::now();
        while start.elapsed() < duration {
            self.link.send_no_ack(descriptor, &params).await;
            self.smart_sleep(PCMD_INTERVAL).await;
        }
        Ok(())
    }

    /// Take off when thrown (minidrone)
    pub async fn turn_on_auto_takeoff(&mut self) -> Result<bool> {
        let project = self.family().project_name();
        self.send_with_ack(project, "Piloting", "AutoTakeOffMode", &[Value::U8(1)]).await
    }

    /// Maximum vertical speed in m/s, a negative value sets 1 m/s
    pub async fn set_max_vertical_speed(&mut self, value: f32) -> Result<bool> {
        let value = if value < 0.0 { 1.0 } else { value };
        let project = self.family().project_name();
        self.send_with_ack(project, "SpeedSettings", "MaxVerticalSpeed", &[Value::F32(value)]).await
    }

    /// Maximum tilt in degrees, a negative value sets 1 degree
    pub async fn set_max_tilt(&mut self, value: f32) -> Result<bool> {
        let value = if value < 0.0 { 1.0 } else { value };
        let project = self.family().project_name();
        self.send_with_ack(project, "PilotingSettings", "MaxTilt", &[Value::F32(value)]).await
    }

    /// Take a picture with the drone camera
    pub async fn take_picture(&mut self) -> Result<bool> {
        let project = self.family().project_name();
        self.send_with_ack(project, "MediaRecord", "PictureV2", &[]).await
    }

    // The FPV camera replaces the accessories on Wi-Fi
    fn accessory_available(&self) -> bool {
        self.family() == DroneFamily::Minidrone && self.framing == Framing::Ble
    }

    /// Open the claw, `Ok(false)` if no claw can be attached
    pub async fn open_claw(&mut self) -> Result<bool> {
        if !self.accessory_available() {
            return Ok(false);
        }
        let claw_id = self.hub.with_state(|s| s.claw_id);
        self.send_enum("UsbAccessory", "ClawControl", &[Value::U8(claw_id)], "open").await
    }

    /// Close the claw, `Ok(false)` if no claw can be attached
    pub async fn close_claw(&mut self) -> Result<bool> {
        if !self.accessory_available() {
            return Ok(false);
        }
        let claw_id = self.hub.with_state(|s| s.claw_id);
        self.send_enum("UsbAccessory", "ClawControl", &[Value::U8(claw_id)], "close").await
    }

    /// Fire the gun, `Ok(false)` if no gun can be attached
    pub async fn fire_gun(&mut self) -> Result<bool> {
        if !self.accessory_available() {
            return Ok(false);
        }
        let gun_id = self.hub.with_state(|s| s.gun_id);
        self.send_enum("UsbAccessory", "GunControl", &[Value::U8(gun_id)], "fire").await
    }

    /// Swing gear box: `gear_1`, `gear_2` or `gear_3`
    pub async fn set_plane_gear_box(&mut self, state: &str) -> Result<bool> {
        self.require_family(DroneFamily::Minidrone, "set_plane_gear_box")?;
        self.send_enum("Piloting", "PlaneGearBox", &[], state).await
    }

    /// Swing flying mode: `quadricopter`, `plane_forward` or `plane_backward`
    ///
    /// The current gear box is sent again first.
    pub async fn set_flying_mode(&mut self, mode: &str) -> Result<bool> {
        self.require_family(DroneFamily::Minidrone, "set_flying_mode")?;
        let gear_box = self.hub.with_state(|s| s.plane_gear_box.clone());
        self.set_plane_gear_box(&gear_box).await?;
        self.send_enum("Piloting", "FlyingMode", &[], mode).await
    }

    /// Move relative to the current position (ardrone3)
    ///
    /// # Arguments
    /// * `dx`, `dy`, `dz` - Displacement in m, front, right and down
    /// * `dpsi` - Rotation in radians
    pub async fn move_relative(&mut self, dx: f32, dy: f32, dz: f32, dpsi: f32) -> Result<bool> {
        self.require_family(DroneFamily::ArDrone3, "move_relative")?;
        let args = [Value::F32(dx), Value::F32(dy), Value::F32(dz), Value::F32(dpsi)];
        self.send_with_ack(DroneFamily::ArDrone3.project_name(), "Piloting", "moveBy", &args).await
    }

    /// Move the camera to a tilt and pan in degrees (ardrone3)
    pub async fn pan_tilt_camera(&mut self, tilt: f32, pan: f32) -> Result<()> {
        self.require_family(DroneFamily::ArDrone3, "pan_tilt_camera")?;
        let args = [Value::F32(tilt), Value::F32(pan)];
        self.send_no_ack(DroneFamily::ArDrone3.project_name(), "Camera", "OrientationV2", &args).await
    }

    /// Move the camera at a tilt and pan velocity in degrees per second (ardrone3)
    ///
    /// With a `duration` the camera is stopped after that time, else it keeps moving.
    pub async fn pan_tilt_camera_velocity(&mut self, tilt: f32, pan: f32, duration: Option<Duration>) -> Result<()> {
        self.require_family(DroneFamily::ArDrone3, "pan_tilt_camera_velocity")?;
        let project = DroneFamily::ArDrone3.project_name();
        self.send_no_ack(project, "Camera", "Velocity", &[Value::F32(tilt), Value::F32(pan)]).await?;
        if let Some(duration) = duration {
            self.smart_sleep(duration).await;
            self.send_no_ack(project, "Camera", "Velocity", &[Value::F32(0.0), Value::F32(0.0)]).await?;
        }
        Ok(())
    }

    /// Start the RTP video stream (ardrone3)
    ///
    /// The stream goes to the client stream port declared in the handshake.
    pub async fn start_video_stream(&mut self) -> Result<bool> {
        self.enable_video_stream(true).await
    }

    /// Stop the RTP video stream (ardrone3)
    pub async fn stop_video_stream(&mut self) -> Result<bool> {
        self.enable_video_stream(false).await
    }

    async fn enable_video_stream(&mut self, enable: bool) -> Result<bool> {
        self.require_family(DroneFamily::ArDrone3, "video stream")?;
        let args = [Value::U8(enable as u8)];
        self.send_with_ack(DroneFamily::ArDrone3.project_name(), "MediaStreaming", "VideoEnable", &args).await
    }

    /// Select the stream mode (ardrone3): `low_latency`, `high_reliability`
    /// or `high_reliability_low_framerate`
    pub async fn set_video_stream_mode(&mut self, mode: &str) -> Result<bool> {
        self.require_family(DroneFamily::ArDrone3, "set_video_stream_mode")?;
        self.send_enum("MediaStreaming", "VideoStreamMode", &[], &mode.to_lowercase()).await
    }
}
