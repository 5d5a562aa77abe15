//! TCP wire protocol: framing and payload codecs.

pub mod codec;
pub mod frame;

pub use codec::{
    encode_setpoint_payload, encode_states_payload, CmdPayload, ConfigPayload, StatsPayload,
};
pub use frame::{Frame, FrameRx};
