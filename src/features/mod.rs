pub mod framing;

pub use framing::{feature_offset, frequency_channels_for, FrameConfig};
