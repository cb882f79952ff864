pub mod types;
pub mod wire;

pub use types::{
    ClientRegistration, DeviceInfo, Envelope, HeartbeatPayload, MessageKind, ServerErrorPayload,
    UpdatePayload,
};
pub use wire::{
    DosProtectionConfig, FramedMessage, WireConfig, WireProtocolError, DEFAULT_READ_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE,
    SUSPICIOUS_MESSAGE_THRESHOLD,
};
