//! # Wire codec
//!
//! Little-endian encoding of command parameters, outbound frame construction
//! and inbound frame decoding for both transports.
//!
//! Radio frames start with a 7 bytes header:
//!
//! ```text
//! [data_kind: u8, channel_id: u8, sequence_id: u8, frame_length: u32]
//! ```
//!
//! where `frame_length` includes the header. Several frames may be packed in
//! one datagram. BLE frames only carry `[packet_type: u8, sequence_id: u8]`,
//! the channel being the characteristic the frame was written to.
//!
//! Command frames then carry `[project_id: u8, class_id: u8, command_id: u16]`
//! followed by the parameters in schema order.

use std::fmt::{self, Display};

use crate::commands::CommandDescriptor;
use crate::error::{Error, Result};
use crate::resolver::{EnumTable, UNKNOWN_ENUM_VALUE};
use crate::schema::{FieldType, SchemaEntry};

/// Length of the radio frame header
pub const WIFI_HEADER_LEN: usize = 7;
/// Length of the BLE frame header
pub const BLE_HEADER_LEN: usize = 2;
/// Length of the command descriptor at the start of a command body
pub const COMMAND_HEADER_LEN: usize = 4;

/// Frame data kind, first byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataKind {
    /// Acknowledgement of a frame
    Ack = 1,
    /// Data not requiring an acknowledgement
    DataNoAck = 2,
    /// Low latency data (video, high priority commands)
    LowLatencyData = 3,
    /// Data requiring an acknowledgement
    DataWithAck = 4,
}

impl DataKind {
    /// Parse a data kind; `None` for values outside of the protocol
    pub fn from_u8(value: u8) -> Option<DataKind> {
        match value {
            1 => Some(DataKind::Ack),
            2 => Some(DataKind::DataNoAck),
            3 => Some(DataKind::LowLatencyData),
            4 => Some(DataKind::DataWithAck),
            _ => None,
        }
    }
}

impl From<DataKind> for u8 {
    fn from(kind: DataKind) -> u8 {
        kind as u8
    }
}

/// Frame layout of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 7 bytes header with channel and length
    Wifi,
    /// 2 bytes header, channel given by the characteristic
    Ble,
}

/// A typed parameter or decoded sensor value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Unsigned 8 bit integer
    U8(u8),
    /// Signed 8 bit integer
    I8(i8),
    /// Unsigned 16 bit integer
    U16(u16),
    /// Signed 16 bit integer
    I16(i16),
    /// Unsigned 32 bit integer
    U32(u32),
    /// Signed 32 bit integer
    I32(i32),
    /// Unsigned 64 bit integer
    U64(u64),
    /// Signed 64 bit integer
    I64(i64),
    /// 32 bit float
    F32(f32),
    /// 64 bit float
    F64(f64),
    /// String, or resolved enum variant name
    Str(String),
    /// Raw enum index
    Enum(u32),
    /// Presence flag of a notification without arguments
    Flag(bool),
}

impl Value {
    // Integral view of the value, used for range checked packing
    fn integral(&self) -> Option<i128> {
        match *self {
            Value::U8(v) => Some(v.into()),
            Value::I8(v) => Some(v.into()),
            Value::U16(v) => Some(v.into()),
            Value::I16(v) => Some(v.into()),
            Value::U32(v) => Some(v.into()),
            Value::I32(v) => Some(v.into()),
            Value::U64(v) => Some(v.into()),
            Value::I64(v) => Some(v.into()),
            Value::Enum(v) => Some(v.into()),
            Value::Flag(v) => Some(v.into()),
            _ => None,
        }
    }

    /// Value as a non-negative integer, used to index enum names
    pub fn as_index(&self) -> Option<u64> {
        self.integral().and_then(|v| u64::try_from(v).ok())
    }

    /// Value as a float, integers are converted
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v.into()),
            Value::F64(v) => Some(v),
            _ => self.integral().map(|v| v as f64),
        }
    }

    /// Value as a signed integer
    pub fn as_i64(&self) -> Option<i64> {
        self.integral().and_then(|v| i64::try_from(v).ok())
    }

    /// Value as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Enum(v) => write!(f, "enum({})", v),
            Value::Flag(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value)
            }
        })*
    };
}

value_from!(u8 => U8, i8 => I8, u16 => U16, i16 => I16, u32 => U32, i32 => I32,
    u64 => U64, i64 => I64, f32 => F32, f64 => F64, String => Str, bool => Flag);

fn mismatch(value: &Value, field_type: &FieldType) -> Error {
    Error::InvalidParameter(format!("cannot pack {:?} as {}", value, field_type))
}

fn pack_int<T: TryFrom<i128>>(value: &Value, field_type: &FieldType) -> Result<T> {
    value
        .integral()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| mismatch(value, field_type))
}

/// Encode one parameter
///
/// Integers are range checked against the field width, floats accept any
/// numeric value, enums accept an index or a variant name, strings are
/// encoded as their content bytes.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if the value does not fit the type.
pub fn pack_scalar(value: &Value, field_type: &FieldType) -> Result<Vec<u8>> {
    let bytes = match field_type {
        FieldType::U8 => pack_int::<u8>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::I8 => pack_int::<i8>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::U16 => pack_int::<u16>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::I16 => pack_int::<i16>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::U32 => pack_int::<u32>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::I32 => pack_int::<i32>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::U64 => pack_int::<u64>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::I64 => pack_int::<i64>(value, field_type)?.to_le_bytes().to_vec(),
        FieldType::F32 => {
            let v = value.as_f64().ok_or_else(|| mismatch(value, field_type))?;
            (v as f32).to_le_bytes().to_vec()
        }
        FieldType::F64 => {
            let v = value.as_f64().ok_or_else(|| mismatch(value, field_type))?;
            v.to_le_bytes().to_vec()
        }
        FieldType::Str => match value {
            Value::Str(s) => s.as_bytes().to_vec(),
            _ => return Err(mismatch(value, field_type)),
        },
        FieldType::Enum(names) => {
            let index = match value {
                Value::Str(name) => names
                    .iter()
                    .position(|n| n == name)
                    .and_then(|i| u32::try_from(i).ok())
                    .ok_or_else(|| mismatch(value, field_type))?,
                _ => pack_int::<u32>(value, field_type)?,
            };
            index.to_le_bytes().to_vec()
        }
        FieldType::Unknown(_) => return Err(mismatch(value, field_type)),
    };
    Ok(bytes)
}

/// Encode a parameter list in declaration order
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if the number of values does not match
/// the number of types or if one value does not fit its type.
pub fn encode_params(values: &[Value], types: &[FieldType]) -> Result<Vec<u8>> {
    if values.len() != types.len() {
        return Err(Error::InvalidParameter(format!(
            "expected {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }

    let mut bytes = Vec::new();
    for (value, field_type) in values.iter().zip(types) {
        bytes.extend(pack_scalar(value, field_type)?);
    }
    Ok(bytes)
}

/// Build one frame around a payload
///
/// For [`Framing::Ble`] the `channel_id` is not encoded, it is given by the
/// characteristic the frame is written to.
pub fn build_frame(framing: Framing, kind: DataKind, channel_id: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    match framing {
        Framing::Wifi => {
            let length = (WIFI_HEADER_LEN + payload.len()) as u32;
            let mut frame = Vec::with_capacity(WIFI_HEADER_LEN + payload.len());
            frame.extend([kind.into(), channel_id, seq]);
            frame.extend(length.to_le_bytes());
            frame.extend(payload);
            frame
        }
        Framing::Ble => {
            let mut frame = Vec::with_capacity(BLE_HEADER_LEN + payload.len());
            frame.extend([kind.into(), seq]);
            frame.extend(payload);
            frame
        }
    }
}

/// Build a command frame: header, command descriptor, then the packed parameters
pub fn build_command_packet(
    framing: Framing,
    kind: DataKind,
    channel_id: u8,
    seq: u8,
    descriptor: CommandDescriptor,
    params: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(COMMAND_HEADER_LEN + params.len());
    payload.extend(descriptor.to_bytes());
    payload.extend(params);
    build_frame(framing, kind, channel_id, seq, &payload)
}

/// Header of a radio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw data kind, see [`DataKind`]
    pub data_kind: u8,
    /// Buffer id
    pub channel_id: u8,
    /// Sequence number on the buffer
    pub sequence_id: u8,
    /// Frame length including the header
    pub declared_length: u32,
}

impl FrameHeader {
    /// Parsed data kind, `None` if not part of the protocol
    pub fn kind(&self) -> Option<DataKind> {
        DataKind::from_u8(self.data_kind)
    }
}

/// Decode a radio frame header
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if fewer than 7 bytes are available, or if
/// the declared length is shorter than the header or longer than `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader> {
    if bytes.len() < WIFI_HEADER_LEN {
        return Err(Error::MalformedFrame(format!(
            "frame header needs {} bytes, got {}",
            WIFI_HEADER_LEN,
            bytes.len()
        )));
    }

    let header = FrameHeader {
        data_kind: bytes[0],
        channel_id: bytes[1],
        sequence_id: bytes[2],
        declared_length: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
    };

    let length = header.declared_length as usize;
    if length < WIFI_HEADER_LEN || length > bytes.len() {
        return Err(Error::MalformedFrame(format!(
            "declared length {} with {} bytes available",
            header.declared_length,
            bytes.len()
        )));
    }

    Ok(header)
}

/// Header of a BLE frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleHeader {
    /// Raw packet type, see [`DataKind`]
    pub packet_type: u8,
    /// Sequence number on the characteristic
    pub sequence_id: u8,
}

/// Decode a BLE frame header, returns the header and the payload
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if fewer than 2 bytes are available.
pub fn decode_ble_header(bytes: &[u8]) -> Result<(BleHeader, &[u8])> {
    if bytes.len() < BLE_HEADER_LEN {
        return Err(Error::MalformedFrame(format!("BLE frame of {} bytes", bytes.len())));
    }
    let header = BleHeader { packet_type: bytes[0], sequence_id: bytes[1] };
    Ok((header, &bytes[BLE_HEADER_LEN..]))
}

/// Iterator over the frames packed in one datagram
///
/// Yields each header with its payload. A malformed header ends the
/// iteration after yielding the error, since the following frame boundaries
/// cannot be known.
pub struct Frames<'a> {
    remaining: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<(FrameHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() || self.failed {
            return None;
        }

        match decode_header(self.remaining) {
            Ok(header) => {
                let (frame, rest) = self.remaining.split_at(header.declared_length as usize);
                self.remaining = rest;
                Some(Ok((header, &frame[WIFI_HEADER_LEN..])))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Split a datagram into its frames
pub fn split_frames(datagram: &[u8]) -> Frames<'_> {
    Frames { remaining: datagram, failed: false }
}

/// Decode the command descriptor at the start of a frame payload
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the payload is shorter than 4 bytes.
pub fn decode_command_header(payload: &[u8]) -> Result<(CommandDescriptor, &[u8])> {
    if payload.len() < COMMAND_HEADER_LEN {
        return Err(Error::MalformedFrame(format!("command header of {} bytes", payload.len())));
    }
    let descriptor = CommandDescriptor::new(payload[0], payload[1], u16::from_le_bytes([payload[2], payload[3]]));
    Ok((descriptor, &payload[COMMAND_HEADER_LEN..]))
}

fn read_fixed(body: &[u8], field_type: &FieldType) -> Option<Value> {
    let width = field_type.width()?;
    let b = body.get(..width)?;
    let value = match field_type {
        FieldType::U8 => Value::U8(b[0]),
        FieldType::I8 => Value::I8(i8::from_le_bytes([b[0]])),
        FieldType::U16 => Value::U16(u16::from_le_bytes([b[0], b[1]])),
        FieldType::I16 => Value::I16(i16::from_le_bytes([b[0], b[1]])),
        FieldType::U32 => Value::U32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        FieldType::I32 => Value::I32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        FieldType::F32 => Value::F32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        FieldType::Enum(_) => Value::Enum(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        FieldType::U64 => Value::U64(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
        FieldType::I64 => Value::I64(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
        FieldType::F64 => Value::F64(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
        FieldType::Str | FieldType::Unknown(_) => return None,
    };
    Some(value)
}

/// Decode the arguments of a command body
///
/// Fields are read in schema order. Strings extend to the next NUL byte or to
/// the end of the body. Enum indices are replaced by their variant name, or
/// by `UNKNOWN_ENUM_VALUE` when out of range. A notification without
/// arguments decodes to `Flag(true)`.
///
/// A field of unknown type, or a truncated field, decodes to `None`; the
/// fields following it cannot be located and decode to `None` as well.
pub fn decode_body(body: &[u8], entry: &SchemaEntry, enums: &EnumTable) -> Vec<(String, Option<Value>)> {
    let mut offset = 0;
    let mut lost = false;
    let mut values = Vec::with_capacity(entry.fields.len());

    for field in &entry.fields {
        if lost {
            values.push((field.name.clone(), None));
            continue;
        }

        let rest = body.get(offset..).unwrap_or(&[]);
        let value = match &field.field_type {
            None => Some(Value::Flag(true)),
            Some(FieldType::Unknown(type_name)) => {
                log::warn!("Field {} has unsupported type {}", field.name, type_name);
                lost = true;
                None
            }
            Some(FieldType::Str) => {
                let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
                offset += (end + 1).min(rest.len());
                Some(Value::Str(String::from_utf8_lossy(&rest[..end]).into_owned()))
            }
            // Enums are 4 bytes LE on the wire, the same width the commands use
            Some(FieldType::Enum(names)) => match read_fixed(rest, &FieldType::U32) {
                Some(Value::U32(index)) => {
                    offset += 4;
                    let name = if names.is_empty() {
                        enums.variant_name(&field.name, index.into())
                    } else {
                        Some(names.get(index as usize).cloned().unwrap_or_else(|| UNKNOWN_ENUM_VALUE.to_string()))
                    };
                    Some(Value::Str(name.unwrap_or_else(|| UNKNOWN_ENUM_VALUE.to_string())))
                }
                _ => {
                    lost = true;
                    None
                }
            },
            Some(field_type) => match read_fixed(rest, field_type) {
                Some(value) => {
                    offset += field_type.width().unwrap_or(0);
                    Some(value)
                }
                None => {
                    log::warn!("Field {} truncated, {} bytes left", field.name, rest.len());
                    lost = true;
                    None
                }
            },
        };

        values.push((field.name.clone(), value));
    }

    values
}
