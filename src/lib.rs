//! Quantized 2D convolution execution engine for a streaming
//! keyword-spotting network.
//!
//! The operator family is small (per-channel quantized 2D convolution over
//! 8-bit activations, 16-bit on the wide path) but it runs under several
//! execution strategies that must agree bit for bit: direct nested-loop
//! accumulation, im2col expansion into a dense integer matmul, a tiled
//! im2col variant bounded by fixed scratch capacity, and a 64-bit-accumulator
//! path for 16-bit activations.
//!
//! The owning runtime prepares an operator once ([`op::PreparedConv2d`]) and
//! evaluates it once per inference; all tensor buffers stay caller-owned.

pub mod features;
pub mod kernels;
pub mod op;
pub mod perf;
pub mod tensor;

pub use kernels::conv2d::{ConvError, ConvParams, ConvStrategy};
pub use op::{Conv2dConfig, PreparedConv2d};
