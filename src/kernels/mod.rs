pub mod conv2d;
pub mod quantization;

pub use conv2d::{
    conv_output_shape, conv_per_channel, conv_per_channel_wide, ConvError, ConvParams,
    ConvStrategy, MAX_FILTER_VOLUME, MAX_OUTPUT_CHANNELS, MAX_PATCH_COUNT,
};
pub use quantization::{multiply_by_quantized_multiplier, multiply_by_quantized_multiplier_wide};
