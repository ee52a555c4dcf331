//! # Sensor state
//!
//! Decoded notifications of the drone end up in a [`SensorState`]: a handful
//! of well known sensors are promoted to typed fields, and every sensor is
//! also kept by name in a generic map, last write wins.
//!
//! [`SensorHub`] is the sink the links deliver inbound data frames to. It
//! resolves the schema, decodes the frame, updates the state and calls the
//! optional observer, all on the receive task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::codec::{Value, decode_body, decode_command_header};
use crate::error::{Error, Result};
use crate::link::SensorSink;
use crate::resolver::{EnumTable, SensorSchemaResolver, UNKNOWN_ENUM_VALUE};
use crate::schema::DroneFamily;

/// Sensors promoted to typed fields of [`SensorState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownSensor {
    /// `BatteryStateChanged_battery_percent`
    Battery,
    /// `FlyingStateChanged_state`
    FlyingState,
    /// `ClawState_id`
    ClawId,
    /// `ClawState_state`
    ClawState,
    /// `GunState_id`
    GunId,
    /// `GunState_state`
    GunState,
    /// `DroneSpeed_speed_x`
    SpeedX,
    /// `DroneSpeed_speed_y`
    SpeedY,
    /// `DroneSpeed_speed_z`
    SpeedZ,
    /// `DroneSpeed_ts`
    SpeedTs,
    /// `DroneAltitude_altitude`
    Altitude,
    /// `DroneAltitude_ts`
    AltitudeTs,
    /// `DroneQuaternion_q_w`
    QuaternionW,
    /// `DroneQuaternion_q_x`
    QuaternionX,
    /// `DroneQuaternion_q_y`
    QuaternionY,
    /// `DroneQuaternion_q_z`
    QuaternionZ,
    /// `DroneQuaternion_ts`
    QuaternionTs,
    /// `FlyingModeChanged_mode`
    FlyingMode,
    /// `PlaneGearBoxChanged_state`
    PlaneGearBox,
    /// End of a relative move (`PilotingEvent_moveByEnd`)
    RelativeMoveEnded,
    /// `OrientationV2_tilt`
    CameraTilt,
    /// `OrientationV2_pan`
    CameraPan,
}

impl KnownSensor {
    /// Match a sensor field name
    pub fn from_name(name: &str) -> Option<KnownSensor> {
        let sensor = match name {
            "BatteryStateChanged_battery_percent" => KnownSensor::Battery,
            "FlyingStateChanged_state" => KnownSensor::FlyingState,
            "ClawState_id" => KnownSensor::ClawId,
            "ClawState_state" => KnownSensor::ClawState,
            "GunState_id" => KnownSensor::GunId,
            "GunState_state" => KnownSensor::GunState,
            "DroneSpeed_speed_x" => KnownSensor::SpeedX,
            "DroneSpeed_speed_y" => KnownSensor::SpeedY,
            "DroneSpeed_speed_z" => KnownSensor::SpeedZ,
            "DroneSpeed_ts" => KnownSensor::SpeedTs,
            "DroneAltitude_altitude" => KnownSensor::Altitude,
            "DroneAltitude_ts" => KnownSensor::AltitudeTs,
            "DroneQuaternion_q_w" => KnownSensor::QuaternionW,
            "DroneQuaternion_q_x" => KnownSensor::QuaternionX,
            "DroneQuaternion_q_y" => KnownSensor::QuaternionY,
            "DroneQuaternion_q_z" => KnownSensor::QuaternionZ,
            "DroneQuaternion_ts" => KnownSensor::QuaternionTs,
            "FlyingModeChanged_mode" => KnownSensor::FlyingMode,
            "PlaneGearBoxChanged_state" => KnownSensor::PlaneGearBox,
            "PilotingEvent_moveByEnd" => KnownSensor::RelativeMoveEnded,
            "OrientationV2_tilt" => KnownSensor::CameraTilt,
            "OrientationV2_pan" => KnownSensor::CameraPan,
            // the schema names the fields of the event after its arguments
            n if n.starts_with("moveByEnd_") => KnownSensor::RelativeMoveEnded,
            _ => return None,
        };
        Some(sensor)
    }
}

/// Last known state of the drone sensors
#[derive(Debug, Clone)]
pub struct SensorState {
    /// Battery charge in percent
    pub battery: u8,
    /// Flying state (`landed`, `takingoff`, `hovering`, ...)
    pub flying_state: String,
    /// Flying mode of the Swing
    pub flying_mode: String,
    /// Plane gear box of the Swing
    pub plane_gear_box: String,
    /// Id of the attached claw
    pub claw_id: u8,
    /// State of the attached claw
    pub claw_state: Option<String>,
    /// Id of the attached gun
    pub gun_id: u8,
    /// State of the attached gun
    pub gun_state: Option<String>,
    /// Speed along x in m/s
    pub speed_x: f64,
    /// Speed along y in m/s
    pub speed_y: f64,
    /// Speed along z in m/s
    pub speed_z: f64,
    /// Timestamp of the last speed
    pub speed_ts: f64,
    /// Altitude in m, -1 until first received
    pub altitude: f64,
    /// Timestamp of the last altitude
    pub altitude_ts: f64,
    /// Orientation quaternion `[w, x, y, z]`
    pub quaternion: [f64; 4],
    /// Timestamp of the last quaternion, -1 until first received
    pub quaternion_ts: f64,
    /// A relative move reported its end
    pub relative_move_ended: bool,
    /// A camera tilt move reported its end
    pub camera_move_ended_tilt: bool,
    /// A camera pan move reported its end
    pub camera_move_ended_pan: bool,
    sensors: HashMap<String, Option<Value>>,
}

impl SensorState {
    /// Initial state of a freshly connected drone
    pub fn new(family: DroneFamily) -> Self {
        let flying_state = match family {
            DroneFamily::Minidrone => "landed",
            DroneFamily::ArDrone3 => "unknown",
        };

        SensorState {
            battery: 100,
            flying_state: flying_state.to_string(),
            flying_mode: "quadricopter".to_string(),
            plane_gear_box: "gear_1".to_string(),
            claw_id: 0,
            claw_state: None,
            gun_id: 0,
            gun_state: None,
            speed_x: 0.0,
            speed_y: 0.0,
            speed_z: 0.0,
            speed_ts: 0.0,
            altitude: -1.0,
            altitude_ts: 0.0,
            quaternion: [0.0; 4],
            quaternion_ts: -1.0,
            relative_move_ended: false,
            camera_move_ended_tilt: false,
            camera_move_ended_pan: false,
            sensors: HashMap::new(),
        }
    }

    /// Apply one decoded sensor value
    ///
    /// Fields registered in `enums` are translated to their variant name,
    /// `UNKNOWN_ENUM_VALUE` if the index is out of range or missing. The value
    /// is stored in the generic map and, for known sensors, in its typed
    /// field.
    pub fn update(&mut self, name: &str, value: Option<Value>, enums: &EnumTable) {
        let value = if enums.names(name).is_some() {
            let resolved = match value {
                Some(Value::Str(s)) => s,
                other => other
                    .and_then(|v| v.as_index())
                    .and_then(|i| enums.variant_name(name, i))
                    .unwrap_or_else(|| UNKNOWN_ENUM_VALUE.to_string()),
            };
            Some(Value::Str(resolved))
        } else {
            value
        };

        if let (Some(sensor), Some(v)) = (KnownSensor::from_name(name), &value) {
            self.promote(sensor, v);
        }
        self.sensors.insert(name.to_string(), value);
    }

    fn promote(&mut self, sensor: KnownSensor, value: &Value) {
        let text = || value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        let number = value.as_f64();
        let small = value.as_index().and_then(|v| u8::try_from(v).ok());

        match sensor {
            KnownSensor::Battery => self.battery = small.unwrap_or(self.battery),
            KnownSensor::FlyingState => self.flying_state = text(),
            KnownSensor::ClawId => self.claw_id = small.unwrap_or(self.claw_id),
            KnownSensor::ClawState => self.claw_state = Some(text()),
            KnownSensor::GunId => self.gun_id = small.unwrap_or(self.gun_id),
            KnownSensor::GunState => self.gun_state = Some(text()),
            KnownSensor::SpeedX => self.speed_x = number.unwrap_or(self.speed_x),
            KnownSensor::SpeedY => self.speed_y = number.unwrap_or(self.speed_y),
            KnownSensor::SpeedZ => self.speed_z = number.unwrap_or(self.speed_z),
            KnownSensor::SpeedTs => self.speed_ts = number.unwrap_or(self.speed_ts),
            KnownSensor::Altitude => self.altitude = number.unwrap_or(self.altitude),
            KnownSensor::AltitudeTs => self.altitude_ts = number.unwrap_or(self.altitude_ts),
            KnownSensor::QuaternionW => self.quaternion[0] = number.unwrap_or(self.quaternion[0]),
            KnownSensor::QuaternionX => self.quaternion[1] = number.unwrap_or(self.quaternion[1]),
            KnownSensor::QuaternionY => self.quaternion[2] = number.unwrap_or(self.quaternion[2]),
            KnownSensor::QuaternionZ => self.quaternion[3] = number.unwrap_or(self.quaternion[3]),
            KnownSensor::QuaternionTs => self.quaternion_ts = number.unwrap_or(self.quaternion_ts),
            KnownSensor::FlyingMode => self.flying_mode = text(),
            KnownSensor::PlaneGearBox => self.plane_gear_box = text(),
            KnownSensor::RelativeMoveEnded => self.relative_move_ended = true,
            KnownSensor::CameraTilt => self.camera_move_ended_tilt = true,
            KnownSensor::CameraPan => self.camera_move_ended_pan = true,
        }
    }

    /// Last value of a sensor by field name
    ///
    /// Returns `None` if the sensor was never received or if its last value
    /// could not be decoded.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.sensors.get(name).and_then(Option::as_ref)
    }

    /// All sensors received so far
    pub fn sensors(&self) -> &HashMap<String, Option<Value>> {
        &self.sensors
    }

    /// `true` when the drone is on the ground (landed or after an emergency)
    pub fn is_landed(&self) -> bool {
        matches!(self.flying_state.as_str(), "landed" | "emergency")
    }

    /// Rotation around the vertical axis, in degrees, from the orientation quaternion
    ///
    /// 0 is the heading of the drone when it was powered on, this is not a
    /// compass heading.
    pub fn estimated_z_orientation(&self) -> f64 {
        let [w, x, y, z] = self.quaternion;
        let t3 = 2.0 * (w * z + x * y);
        let t4 = 1.0 - 2.0 * (y * y + z * z);
        t3.atan2(t4).to_degrees()
    }
}

/// Listener called after every sensor update
///
/// Called synchronously from the receive task with a copy of the state, no
/// lock held. A slow observer delays every following frame, acknowledgements
/// included.
pub trait SensorObserver: Send + Sync {
    /// A sensor was updated
    fn on_update(&self, field_name: &str, state: &SensorState);
}

impl<F> SensorObserver for F
where
    F: Fn(&str, &SensorState) + Send + Sync,
{
    fn on_update(&self, field_name: &str, state: &SensorState) {
        self(field_name, state)
    }
}

/// Sensor sink of a connection: schema resolution, decoding and state
pub struct SensorHub {
    resolver: SensorSchemaResolver,
    state: Mutex<SensorState>,
    observer: RwLock<Option<Arc<dyn SensorObserver>>>,
}

impl SensorHub {
    /// Create a hub with a fresh sensor state
    pub fn new(resolver: SensorSchemaResolver, family: DroneFamily) -> Self {
        SensorHub {
            resolver,
            state: Mutex::new(SensorState::new(family)),
            observer: RwLock::new(None),
        }
    }

    /// Copy of the current sensor state
    pub fn snapshot(&self) -> SensorState {
        self.state.lock().clone()
    }

    /// Run `f` on the current sensor state without copying it
    pub fn with_state<R>(&self, f: impl FnOnce(&SensorState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Register (or clear) the observer
    pub fn set_observer(&self, observer: Option<Arc<dyn SensorObserver>>) {
        *self.observer.write() = observer;
    }

    /// Schema resolver used to decode the frames
    pub fn resolver(&self) -> &SensorSchemaResolver {
        &self.resolver
    }

    /// Decode a command payload and apply its fields
    ///
    /// # Returns
    /// The number of fields applied
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] if the payload is too short and
    /// [`Error::UnknownSensor`] if its command is not in the schema.
    pub fn apply_payload(&self, payload: &[u8]) -> Result<usize> {
        let (descriptor, body) = decode_command_header(payload)?;
        let entry = self
            .resolver
            .resolve(descriptor.project_id, descriptor.class_id, descriptor.command_id)
            .ok_or(Error::UnknownSensor {
                project_id: descriptor.project_id,
                class_id: descriptor.class_id,
                command_id: descriptor.command_id,
            })?;

        let enums = self.resolver.enums();
        let values = decode_body(body, &entry, &enums);
        let observer = self.observer.read().clone();

        let Some(observer) = observer else {
            let mut state = self.state.lock();
            for (name, value) in &values {
                state.update(name, value.clone(), &enums);
            }
            return Ok(values.len());
        };

        // The observer may read the hub, so it only sees copies
        for (name, value) in &values {
            let state = {
                let mut state = self.state.lock();
                state.update(name, value.clone(), &enums);
                state.clone()
            };
            observer.on_update(name, &state);
        }

        Ok(values.len())
    }
}

impl SensorSink for SensorHub {
    fn update_sensors(&self, data_kind: u8, channel_id: u8, sequence_id: u8, raw: &[u8], needs_ack: bool) {
        match self.apply_payload(raw) {
            Ok(count) => log::trace!(
                "Applied {} sensor fields from kind {} buffer {} seq {} (ack: {})",
                count,
                data_kind,
                channel_id,
                sequence_id,
                needs_ack
            ),
            Err(e @ Error::UnknownSensor { .. }) => log::debug!("{}, frame dropped", e),
            Err(e) => log::warn!("Frame on buffer {} seq {} dropped: {}", channel_id, sequence_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaCatalog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flying_enums() -> EnumTable {
        let mut enums = EnumTable::new();
        enums.insert(
            "FlyingStateChanged_state",
            ["landed", "takingoff", "hovering", "flying", "landing", "emergency"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        enums
    }

    fn hub(family: DroneFamily) -> SensorHub {
        let resolver = SensorSchemaResolver::new(Arc::new(SchemaCatalog::builtin().unwrap()), family);
        SensorHub::new(resolver, family)
    }

    #[test]
    fn test_defaults() {
        let mambo = SensorState::new(DroneFamily::Minidrone);
        assert_eq!(mambo.battery, 100);
        assert_eq!(mambo.flying_state, "landed");
        assert_eq!(mambo.flying_mode, "quadricopter");
        assert_eq!(mambo.plane_gear_box, "gear_1");
        assert_eq!(mambo.altitude, -1.0);
        assert_eq!(mambo.quaternion_ts, -1.0);
        assert!(mambo.is_landed());

        let bebop = SensorState::new(DroneFamily::ArDrone3);
        assert_eq!(bebop.flying_state, "unknown");
        assert!(!bebop.is_landed());
    }

    #[test]
    fn test_enum_update_is_promoted_and_stored() {
        let mut state = SensorState::new(DroneFamily::Minidrone);
        state.update("FlyingStateChanged_state", Some(Value::U8(2)), &flying_enums());
        assert_eq!(state.flying_state, "hovering");
        assert_eq!(state.get("FlyingStateChanged_state"), Some(&Value::from("hovering")));
        assert!(!state.is_landed());
    }

    #[test]
    fn test_enum_update_out_of_range() {
        let mut state = SensorState::new(DroneFamily::Minidrone);
        state.update("FlyingStateChanged_state", Some(Value::U8(6)), &flying_enums());
        assert_eq!(state.flying_state, UNKNOWN_ENUM_VALUE);
        state.update("FlyingStateChanged_state", None, &flying_enums());
        assert_eq!(state.get("FlyingStateChanged_state"), Some(&Value::from(UNKNOWN_ENUM_VALUE)));
    }

    #[test]
    fn test_generic_sensor_last_write_wins() {
        let mut state = SensorState::new(DroneFamily::ArDrone3);
        let enums = EnumTable::new();
        state.update("WifiSignalChanged_rssi", Some(Value::I16(-60)), &enums);
        state.update("WifiSignalChanged_rssi", Some(Value::I16(-42)), &enums);
        assert_eq!(state.get("WifiSignalChanged_rssi"), Some(&Value::I16(-42)));
        assert_eq!(state.sensors().len(), 1);
    }

    #[test]
    fn test_promoted_numeric_sensors() {
        let mut state = SensorState::new(DroneFamily::Minidrone);
        let enums = EnumTable::new();
        state.update("BatteryStateChanged_battery_percent", Some(Value::U8(42)), &enums);
        state.update("DroneAltitude_altitude", Some(Value::F32(1.5)), &enums);
        state.update("DroneSpeed_speed_z", Some(Value::F32(-0.25)), &enums);
        state.update("moveByEnd_dX", Some(Value::F32(1.0)), &enums);
        assert_eq!(state.battery, 42);
        assert_eq!(state.altitude, 1.5);
        assert_eq!(state.speed_z, -0.25);
        assert!(state.relative_move_ended);
        assert_eq!(state.get("BatteryStateChanged_battery_percent"), Some(&Value::U8(42)));
    }

    #[test]
    fn test_estimated_z_orientation() {
        let mut state = SensorState::new(DroneFamily::Minidrone);
        // 90 degrees around z
        let half = std::f64::consts::FRAC_1_SQRT_2;
        state.quaternion = [half, 0.0, 0.0, half];
        assert!((state.estimated_z_orientation() - 90.0).abs() < 1e-9);

        state.quaternion = [1.0, 0.0, 0.0, 0.0];
        assert!(state.estimated_z_orientation().abs() < 1e-9);
    }

    #[test]
    fn test_hub_applies_frame_and_calls_observer() {
        let hub = hub(DroneFamily::Minidrone);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        hub.set_observer(Some(Arc::new(move |name: &str, state: &SensorState| {
            assert_eq!(name, "BatteryStateChanged_battery_percent");
            assert_eq!(state.battery, 37);
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        // common.CommonState.BatteryStateChanged(37)
        let count = hub.apply_payload(&[0, 5, 1, 0, 37]).unwrap();
        assert_eq!(count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.snapshot().battery, 37);
    }

    #[test]
    fn test_observer_can_read_hub() {
        let hub = Arc::new(hub(DroneFamily::Minidrone));
        let weak = Arc::downgrade(&hub);
        let seen = Arc::new(AtomicUsize::new(0));
        let battery = seen.clone();
        hub.set_observer(Some(Arc::new(move |_: &str, _: &SensorState| {
            if let Some(hub) = weak.upgrade() {
                battery.store(hub.snapshot().battery as usize, Ordering::SeqCst);
                assert!(hub.with_state(|s| s.is_landed()));
            }
        })));

        let (done, finished) = std::sync::mpsc::channel();
        let worker = hub.clone();
        std::thread::spawn(move || {
            let _ = done.send(worker.apply_payload(&[0, 5, 1, 0, 55]).is_ok());
        });

        let applied = finished.recv_timeout(std::time::Duration::from_secs(2));
        assert_eq!(applied, Ok(true), "apply_payload blocked while the observer read the state");
        assert_eq!(seen.load(Ordering::SeqCst), 55);
    }

    #[test]
    fn test_hub_decodes_enum_frame() {
        let hub = hub(DroneFamily::Minidrone);
        // minidrone.PilotingState.FlyingStateChanged(flying)
        hub.apply_payload(&[2, 3, 1, 0, 3, 0, 0, 0]).unwrap();
        assert_eq!(hub.with_state(|s| s.flying_state.clone()), "flying");
    }

    #[test]
    fn test_hub_rejects_unknown_and_short_frames() {
        let hub = hub(DroneFamily::Minidrone);
        assert!(matches!(hub.apply_payload(&[2, 250, 0, 0]), Err(Error::UnknownSensor { .. })));
        assert!(matches!(hub.apply_payload(&[2, 3]), Err(Error::MalformedFrame(_))));
        // dropped without panicking
        hub.update_sensors(2, 126, 1, &[2, 3], false);
    }
}
