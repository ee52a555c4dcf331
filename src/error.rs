//! Error types for the drone link

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the protocol stack
///
/// Missing acknowledgements are not errors: ack-based sends report a `bool`
/// because packet loss on UDP and BLE is routine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A command, class, project or enum name is not in the static schema
    ///
    /// This means the calling code disagrees with its own command tables and
    /// should abort the operation that triggered it.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Truncated or unparseable frame header or body
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Numeric command triple not present in any schema
    #[error("Unknown sensor: project {project_id}, class {class_id}, command {command_id}")]
    UnknownSensor {
        /// Project id of the frame
        project_id: u8,
        /// Class id of the frame
        class_id: u8,
        /// Command id of the frame
        command_id: u16,
    },

    /// Socket I/O failure
    #[error("Transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    /// Discovery timeout, refused connection or bad negotiation
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Failure reported by the BLE collaborator
    #[error("GATT error: {0}")]
    Gatt(String),

    /// A parameter value does not match its declared type
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration file could not be parsed
    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    /// TOML configuration could not be written
    #[error("Config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}
