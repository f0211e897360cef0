//! Per-channel quantized 2D convolution.
//!
//! One operation, several execution strategies: a direct nested-loop
//! accumulation, an im2col expansion into a dense integer matmul (with a
//! dynamically sized and a fixed-capacity tiled variant), and a wide
//! accumulator path for 16-bit activations. All strategies share the
//! addressing in [`crate::tensor::offset`] and the requantization in
//! [`crate::kernels::quantization`], and produce bit-identical outputs.
//!
//! Input layout: [N, H, W, C]. Weight layout: [C_out, kH, kW, C_in/groups].
//! Output layout: [N, H_out, W_out, C_out]. Channel is the fastest index.

use crate::kernels::quantization::{
    multiply_by_quantized_multiplier, multiply_by_quantized_multiplier_wide,
};
use crate::perf::PerfCounter;
use crate::tensor::{offset, TensorView};
use thiserror::Error;

/// Largest flattened kernel volume (kH * kW * C_in/groups) the tiled im2col
/// scratch holds.
pub const MAX_FILTER_VOLUME: usize = 512;
/// Largest output-position count (H_out * W_out) the tiled im2col scratch
/// holds.
pub const MAX_PATCH_COUNT: usize = 4096;
/// Largest output-channel count the tiled im2col scratch holds.
pub const MAX_OUTPUT_CHANNELS: usize = 512;

/// Execution strategy, fixed when the operator is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    /// Nested-loop accumulation over the kernel window.
    Direct,
    /// im2col expansion with scratch sized exactly to the problem.
    Im2colDynamic,
    /// im2col expansion bounded by the compile-time scratch maxima.
    Im2colTiled,
    /// 16-bit activations, 8-bit weights, 64-bit accumulator.
    WideAccumulator,
}

impl Default for ConvStrategy {
    fn default() -> Self {
        ConvStrategy::Direct
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvError {
    #[error("expected a rank-4 shape, got rank {0}")]
    Rank(usize),
    #[error("activation range inverted: min {min} > max {max}")]
    ActivationRange { min: i32, max: i32 },
    #[error("input depth {input_depth} is not divisible by filter input depth {filter_input_depth}")]
    Grouping {
        input_depth: usize,
        filter_input_depth: usize,
    },
    #[error("output depth {output_depth} is not divisible by the group count {groups}")]
    GroupFilters { output_depth: usize, groups: usize },
    #[error("per-channel table holds {got} entries, output has {expected} channels")]
    PerChannelLen { got: usize, expected: usize },
    #[error("bias holds {got} entries, output has {expected} channels")]
    BiasLen { got: usize, expected: usize },
    #[error("degenerate convolution geometry (zero stride, dilation, or kernel extent, or kernel larger than the padded input)")]
    Geometry,
    #[error("tensor shape {got:?} does not match the prepared shape {expected:?}")]
    ShapeMismatch {
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("output buffer holds {got} elements, the output shape needs {expected}")]
    OutputLen { got: usize, expected: usize },
    #[error("im2col scratch capacity exceeded: kernel volume {volume}, output positions {patches}, output channels {channels}")]
    ScratchCapacity {
        volume: usize,
        patches: usize,
        channels: usize,
    },
    #[error("channel {channel}: multiplier {multiplier} / shift {shift} outside the wide rescale domain")]
    WideRescaleDomain {
        channel: usize,
        multiplier: i32,
        shift: i32,
    },
    #[error("strategy {0:?} does not apply to this activation width")]
    StrategyWidth(ConvStrategy),
}

/// Geometry and quantization parameters resolved once per operator.
#[derive(Debug, Clone)]
pub struct ConvParams {
    /// (height, width)
    pub stride: (usize, usize),
    /// (height, width)
    pub dilation: (usize, usize),
    /// Symmetric (height, width) padding.
    pub padding: (usize, usize),
    /// Added to every input element before multiplication; the negated input
    /// zero point.
    pub input_offset: i32,
    /// Added after requantization on the 8-bit path. The 16-bit path is
    /// symmetric and ignores it.
    pub output_offset: i32,
    pub quantized_activation_min: i32,
    pub quantized_activation_max: i32,
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            dilation: (1, 1),
            padding: (0, 0),
            input_offset: 0,
            output_offset: 0,
            quantized_activation_min: i32::from(i8::MIN),
            quantized_activation_max: i32::from(i8::MAX),
        }
    }
}

/// Output shape implied by the input/filter shapes and the geometry
/// parameters, or an error when the kernel does not fit the padded input.
pub fn conv_output_shape(
    input_shape: &[usize],
    filter_shape: &[usize],
    params: &ConvParams,
) -> Result<[usize; 4], ConvError> {
    if input_shape.len() != 4 {
        return Err(ConvError::Rank(input_shape.len()));
    }
    if filter_shape.len() != 4 {
        return Err(ConvError::Rank(filter_shape.len()));
    }
    let (stride_h, stride_w) = params.stride;
    let (dilation_h, dilation_w) = params.dilation;
    let filter_height = filter_shape[1];
    let filter_width = filter_shape[2];
    if stride_h == 0 || stride_w == 0 || dilation_h == 0 || dilation_w == 0 {
        return Err(ConvError::Geometry);
    }
    if filter_height == 0 || filter_width == 0 {
        return Err(ConvError::Geometry);
    }
    let dilated_height = dilation_h * (filter_height - 1) + 1;
    let dilated_width = dilation_w * (filter_width - 1) + 1;
    let padded_height = input_shape[1] + 2 * params.padding.0;
    let padded_width = input_shape[2] + 2 * params.padding.1;
    if padded_height < dilated_height || padded_width < dilated_width {
        return Err(ConvError::Geometry);
    }
    let output_height = (padded_height - dilated_height) / stride_h + 1;
    let output_width = (padded_width - dilated_width) / stride_w + 1;
    Ok([input_shape[0], output_height, output_width, filter_shape[0]])
}

/// 8-bit per-channel quantized convolution.
///
/// Dispatches to the selected strategy; all of them write identical bytes.
/// Shape and parameter invariants are asserted here because the prepare step
/// has already validated them; the only reportable failure is the tiled
/// variant's scratch capacity guard.
pub fn conv_per_channel(
    params: &ConvParams,
    output_multiplier: &[i32],
    output_shift: &[i32],
    input: &TensorView<i8>,
    filter: &TensorView<i8>,
    bias: Option<&[i32]>,
    output_shape: &[usize],
    output: &mut [i8],
    strategy: ConvStrategy,
    perf: &mut dyn PerfCounter,
) -> Result<(), ConvError> {
    check_conv_invariants(
        params,
        output_multiplier,
        output_shift,
        input.shape.as_ref(),
        filter.shape.as_ref(),
        bias.map(|b| b.len()),
        output_shape,
        output.len(),
    );
    match strategy {
        ConvStrategy::Direct => {
            direct_conv(
                params,
                output_multiplier,
                output_shift,
                input,
                filter,
                bias,
                output_shape,
                output,
                perf,
            );
            Ok(())
        }
        ConvStrategy::Im2colDynamic => {
            im2col_conv(
                params,
                output_multiplier,
                output_shift,
                input,
                filter,
                bias,
                output_shape,
                output,
                perf,
            );
            Ok(())
        }
        ConvStrategy::Im2colTiled => im2col_conv_tiled(
            params,
            output_multiplier,
            output_shift,
            input,
            filter,
            bias,
            output_shape,
            output,
            perf,
        ),
        ConvStrategy::WideAccumulator => Err(ConvError::StrategyWidth(strategy)),
    }
}

/// 16-bit activations, 8-bit weights, 64-bit accumulator.
///
/// Same control structure as the direct strategy. The accumulator must be
/// 64-bit: kernel volumes of a few thousand terms, each bounded by
/// 127 * 65535, overflow 32 bits.
pub fn conv_per_channel_wide(
    params: &ConvParams,
    output_multiplier: &[i32],
    output_shift: &[i32],
    input: &TensorView<i16>,
    filter: &TensorView<i8>,
    bias: Option<&[i64]>,
    output_shape: &[usize],
    output: &mut [i16],
    perf: &mut dyn PerfCounter,
) {
    let input_shape = input.shape.as_ref();
    let filter_shape = filter.shape.as_ref();
    check_conv_invariants(
        params,
        output_multiplier,
        output_shift,
        input_shape,
        filter_shape,
        bias.map(|b| b.len()),
        output_shape,
        output.len(),
    );

    let (stride_h, stride_w) = params.stride;
    let (dilation_h, dilation_w) = params.dilation;
    let (pad_h, pad_w) = params.padding;

    let batches = input_shape[0];
    let input_height = input_shape[1];
    let input_width = input_shape[2];
    let input_depth = input_shape[3];
    let output_depth = filter_shape[0];
    let filter_height = filter_shape[1];
    let filter_width = filter_shape[2];
    let filter_input_depth = filter_shape[3];
    let groups = input_depth / filter_input_depth;
    let filters_per_group = output_depth / groups;
    let output_height = output_shape[1];
    let output_width = output_shape[2];

    let input_data = input.data.as_ref();
    let filter_data = filter.data.as_ref();

    for batch in 0..batches {
        for out_y in 0..output_height {
            let in_y_origin = (out_y * stride_h) as isize - pad_h as isize;
            for out_x in 0..output_width {
                let in_x_origin = (out_x * stride_w) as isize - pad_w as isize;
                for out_channel in 0..output_depth {
                    let group = out_channel / filters_per_group;
                    perf.enter();
                    let mut acc: i64 = 0;
                    for filter_y in 0..filter_height {
                        let in_y = in_y_origin + (dilation_h * filter_y) as isize;
                        if in_y < 0 || in_y >= input_height as isize {
                            continue;
                        }
                        let in_y = in_y as usize;
                        for filter_x in 0..filter_width {
                            let in_x = in_x_origin + (dilation_w * filter_x) as isize;
                            if in_x < 0 || in_x >= input_width as isize {
                                continue;
                            }
                            let in_x = in_x as usize;
                            for in_channel in 0..filter_input_depth {
                                let input_val = i64::from(
                                    input_data[offset(
                                        input_shape,
                                        batch,
                                        in_y,
                                        in_x,
                                        group * filter_input_depth + in_channel,
                                    )],
                                );
                                let filter_val = i64::from(
                                    filter_data[offset(
                                        filter_shape,
                                        out_channel,
                                        filter_y,
                                        filter_x,
                                        in_channel,
                                    )],
                                );
                                acc += filter_val * input_val;
                            }
                        }
                    }
                    perf.exit();
                    if let Some(bias) = bias {
                        acc += bias[out_channel];
                    }
                    let scaled = multiply_by_quantized_multiplier_wide(
                        acc,
                        output_multiplier[out_channel],
                        output_shift[out_channel],
                    );
                    let clamped = scaled
                        .clamp(params.quantized_activation_min, params.quantized_activation_max);
                    output[offset(output_shape, batch, out_y, out_x, out_channel)] =
                        clamped as i16;
                }
            }
        }
    }
}

fn check_conv_invariants(
    params: &ConvParams,
    output_multiplier: &[i32],
    output_shift: &[i32],
    input_shape: &[usize],
    filter_shape: &[usize],
    bias_len: Option<usize>,
    output_shape: &[usize],
    output_len: usize,
) {
    assert_eq!(
        input_shape.len(),
        4,
        "Conv2d: expected rank-4 input, got rank {}",
        input_shape.len()
    );
    assert_eq!(
        filter_shape.len(),
        4,
        "Conv2d: expected rank-4 filter, got rank {}",
        filter_shape.len()
    );
    assert_eq!(
        output_shape.len(),
        4,
        "Conv2d: expected rank-4 output, got rank {}",
        output_shape.len()
    );
    assert!(params.quantized_activation_min <= params.quantized_activation_max);
    assert_eq!(input_shape[0], output_shape[0], "Conv2d: batch mismatch");
    assert_eq!(
        filter_shape[0], output_shape[3],
        "Conv2d: output depth mismatch"
    );

    let input_depth = input_shape[3];
    let filter_input_depth = filter_shape[3];
    assert!(filter_input_depth > 0 && input_depth % filter_input_depth == 0);
    let groups = input_depth / filter_input_depth;
    assert_eq!(filter_shape[0] % groups, 0);

    let output_depth = filter_shape[0];
    assert_eq!(output_multiplier.len(), output_depth);
    assert_eq!(output_shift.len(), output_depth);
    if let Some(bias_len) = bias_len {
        assert_eq!(bias_len, output_depth);
    }
    assert_eq!(output_len, output_shape.iter().product::<usize>());
}

/// Requantize an 8-bit-path accumulator and narrow it into storage range.
#[inline]
fn downscale(acc: i32, multiplier: i32, shift: i32, params: &ConvParams) -> i8 {
    let scaled = multiply_by_quantized_multiplier(acc, multiplier, shift) + params.output_offset;
    scaled.clamp(params.quantized_activation_min, params.quantized_activation_max) as i8
}

fn direct_conv(
    params: &ConvParams,
    output_multiplier: &[i32],
    output_shift: &[i32],
    input: &TensorView<i8>,
    filter: &TensorView<i8>,
    bias: Option<&[i32]>,
    output_shape: &[usize],
    output: &mut [i8],
    perf: &mut dyn PerfCounter,
) {
    let input_shape = input.shape.as_ref();
    let filter_shape = filter.shape.as_ref();

    let (stride_h, stride_w) = params.stride;
    let (dilation_h, dilation_w) = params.dilation;
    let (pad_h, pad_w) = params.padding;
    let input_offset = params.input_offset;

    let batches = input_shape[0];
    let input_height = input_shape[1];
    let input_width = input_shape[2];
    let input_depth = input_shape[3];
    let output_depth = filter_shape[0];
    let filter_height = filter_shape[1];
    let filter_width = filter_shape[2];
    let filter_input_depth = filter_shape[3];
    let groups = input_depth / filter_input_depth;
    let filters_per_group = output_depth / groups;
    let output_height = output_shape[1];
    let output_width = output_shape[2];

    let input_data = input.data.as_ref();
    let filter_data = filter.data.as_ref();

    for batch in 0..batches {
        for out_y in 0..output_height {
            let in_y_origin = (out_y * stride_h) as isize - pad_h as isize;
            for out_x in 0..output_width {
                let in_x_origin = (out_x * stride_w) as isize - pad_w as isize;
                for out_channel in 0..output_depth {
                    let group = out_channel / filters_per_group;
                    perf.enter();
                    let mut acc: i32 = 0;
                    for filter_y in 0..filter_height {
                        let in_y = in_y_origin + (dilation_h * filter_y) as isize;
                        // Zero padding: taps outside the image are skipped,
                        // which equals a zero-point-valued input contribution.
                        if in_y < 0 || in_y >= input_height as isize {
                            continue;
                        }
                        let in_y = in_y as usize;
                        for filter_x in 0..filter_width {
                            let in_x = in_x_origin + (dilation_w * filter_x) as isize;
                            if in_x < 0 || in_x >= input_width as isize {
                                continue;
                            }
                            let in_x = in_x as usize;
                            for in_channel in 0..filter_input_depth {
                                let input_val = i32::from(
                                    input_data[offset(
                                        input_shape,
                                        batch,
                                        in_y,
                                        in_x,
                                        group * filter_input_depth + in_channel,
                                    )],
                                );
                                let filter_val = i32::from(
                                    filter_data[offset(
                                        filter_shape,
                                        out_channel,
                                        filter_y,
                                        filter_x,
                                        in_channel,
                                    )],
                                );
                                acc += filter_val * (input_val + input_offset);
                            }
                        }
                    }
                    perf.exit();
                    if let Some(bias) = bias {
                        acc += bias[out_channel];
                    }
                    output[offset(output_shape, batch, out_y, out_x, out_channel)] = downscale(
                        acc,
                        output_multiplier[out_channel],
                        output_shift[out_channel],
                        params,
                    );
                }
            }
        }
    }
}

/// Integer matmul over the reshaped weights and the patch matrix:
/// [rows, depth] x [depth, cols] -> [rows, cols].
fn integer_gemm(weights: &[i8], patches: &[i32], products: &mut [i32], rows: usize, depth: usize, cols: usize) {
    for i in 0..rows {
        let weight_row = &weights[i * depth..(i + 1) * depth];
        for j in 0..cols {
            let mut acc: i32 = 0;
            for (k, &w) in weight_row.iter().enumerate() {
                acc += i32::from(w) * patches[k * cols + j];
            }
            products[i * cols + j] = acc;
        }
    }
}

/// Fill one group's patch matrix: one row per flattened
/// (filter_y, filter_x, in_channel) index in filter-native order, one column
/// per output position. Out-of-range taps take the zero sentinel so padding
/// contributes exactly what the direct strategy's skipped taps contribute.
fn fill_patches(
    params: &ConvParams,
    input_shape: &[usize],
    input_data: &[i8],
    batch: usize,
    group: usize,
    filter_height: usize,
    filter_width: usize,
    filter_input_depth: usize,
    output_height: usize,
    output_width: usize,
    patches: &mut [i32],
) {
    let (stride_h, stride_w) = params.stride;
    let (dilation_h, dilation_w) = params.dilation;
    let (pad_h, pad_w) = params.padding;
    let input_height = input_shape[1];
    let input_width = input_shape[2];
    let patch_count = output_height * output_width;

    for filter_y in 0..filter_height {
        for filter_x in 0..filter_width {
            for in_channel in 0..filter_input_depth {
                let row =
                    (filter_y * filter_width + filter_x) * filter_input_depth + in_channel;
                let row_base = row * patch_count;
                for out_y in 0..output_height {
                    let in_y =
                        (out_y * stride_h) as isize - pad_h as isize + (dilation_h * filter_y) as isize;
                    let window_base = row_base + out_y * output_width;
                    if in_y < 0 || in_y >= input_height as isize {
                        patches[window_base..window_base + output_width].fill(0);
                        continue;
                    }
                    let in_y = in_y as usize;
                    for out_x in 0..output_width {
                        let in_x = (out_x * stride_w) as isize - pad_w as isize
                            + (dilation_w * filter_x) as isize;
                        patches[window_base + out_x] =
                            if in_x >= 0 && in_x < input_width as isize {
                                i32::from(input_data[offset(
                                    input_shape,
                                    batch,
                                    in_y,
                                    in_x as usize,
                                    group * filter_input_depth + in_channel,
                                )]) + params.input_offset
                            } else {
                                0
                            };
                    }
                }
            }
        }
    }
}

/// Scatter one group's product matrix back into the output tensor with fused
/// bias, requantization, and activation clamp.
fn scatter_products(
    params: &ConvParams,
    output_multiplier: &[i32],
    output_shift: &[i32],
    bias: Option<&[i32]>,
    products: &[i32],
    batch: usize,
    group: usize,
    filters_per_group: usize,
    output_shape: &[usize],
    output: &mut [i8],
) {
    let output_height = output_shape[1];
    let output_width = output_shape[2];
    let patch_count = output_height * output_width;

    for out_y in 0..output_height {
        for out_x in 0..output_width {
            let window = out_y * output_width + out_x;
            for group_channel in 0..filters_per_group {
                let out_channel = group * filters_per_group + group_channel;
                let mut acc = products[group_channel * patch_count + window];
                if let Some(bias) = bias {
                    acc += bias[out_channel];
                }
                output[offset(output_shape, batch, out_y, out_x, out_channel)] = downscale(
                    acc,
                    output_multiplier[out_channel],
                    output_shift[out_channel],
                    params,
                );
            }
        }
    }
}

fn im2col_conv(
    params: &ConvParams,
    output_multiplier: &[i32],
    output_shift: &[i32],
    input: &TensorView<i8>,
    filter: &TensorView<i8>,
    bias: Option<&[i32]>,
    output_shape: &[usize],
    output: &mut [i8],
    perf: &mut dyn PerfCounter,
) {
    let input_shape = input.shape.as_ref();
    let filter_shape = filter.shape.as_ref();

    let batches = input_shape[0];
    let input_depth = input_shape[3];
    let output_depth = filter_shape[0];
    let filter_height = filter_shape[1];
    let filter_width = filter_shape[2];
    let filter_input_depth = filter_shape[3];
    let groups = input_depth / filter_input_depth;
    let filters_per_group = output_depth / groups;
    let output_height = output_shape[1];
    let output_width = output_shape[2];

    let volume = filter_height * filter_width * filter_input_depth;
    let patch_count = output_height * output_width;

    let input_data = input.data.as_ref();
    let filter_data = filter.data.as_ref();

    // Call-local scratch sized exactly to the problem, reused across batches
    // and groups.
    let mut patches: Vec<i32> = vec![0; volume * patch_count];
    let mut products: Vec<i32> = vec![0; filters_per_group * patch_count];

    for batch in 0..batches {
        for group in 0..groups {
            fill_patches(
                params,
                input_shape,
                input_data,
                batch,
                group,
                filter_height,
                filter_width,
                filter_input_depth,
                output_height,
                output_width,
                &mut patches,
            );

            // The weight tensor's native layout already is one row of
            // `volume` values per output channel, so the reshape is a borrow.
            let weights =
                &filter_data[group * filters_per_group * volume..(group + 1) * filters_per_group * volume];

            perf.enter();
            integer_gemm(
                weights,
                &patches,
                &mut products,
                filters_per_group,
                volume,
                patch_count,
            );
            perf.exit();

            scatter_products(
                params,
                output_multiplier,
                output_shift,
                bias,
                &products,
                batch,
                group,
                filters_per_group,
                output_shape,
                output,
            );
        }
    }
}

/// Fixed-capacity scratch for the tiled variant. Holding the declared
/// maxima is the memory budget; a problem exceeding any of them must be
/// rejected before anything is written.
struct TiledScratch {
    weights: Vec<i8>,
    patches: Vec<i32>,
    products: Vec<i32>,
}

impl TiledScratch {
    fn reserve(
        volume: usize,
        patch_count: usize,
        output_depth: usize,
        filters_per_group: usize,
    ) -> Result<Self, ConvError> {
        if volume > MAX_FILTER_VOLUME
            || patch_count > MAX_PATCH_COUNT
            || output_depth > MAX_OUTPUT_CHANNELS
        {
            return Err(ConvError::ScratchCapacity {
                volume,
                patches: patch_count,
                channels: output_depth,
            });
        }
        Ok(Self {
            weights: vec![0; filters_per_group * volume],
            patches: vec![0; volume * patch_count],
            products: vec![0; filters_per_group * patch_count],
        })
    }
}

fn im2col_conv_tiled(
    params: &ConvParams,
    output_multiplier: &[i32],
    output_shift: &[i32],
    input: &TensorView<i8>,
    filter: &TensorView<i8>,
    bias: Option<&[i32]>,
    output_shape: &[usize],
    output: &mut [i8],
    perf: &mut dyn PerfCounter,
) -> Result<(), ConvError> {
    let input_shape = input.shape.as_ref();
    let filter_shape = filter.shape.as_ref();

    let batches = input_shape[0];
    let input_depth = input_shape[3];
    let output_depth = filter_shape[0];
    let filter_height = filter_shape[1];
    let filter_width = filter_shape[2];
    let filter_input_depth = filter_shape[3];
    let groups = input_depth / filter_input_depth;
    let filters_per_group = output_depth / groups;
    let output_height = output_shape[1];
    let output_width = output_shape[2];

    let volume = filter_height * filter_width * filter_input_depth;
    let patch_count = output_height * output_width;

    let mut scratch = TiledScratch::reserve(volume, patch_count, output_depth, filters_per_group)?;

    let input_data = input.data.as_ref();
    let filter_data = filter.data.as_ref();

    for batch in 0..batches {
        for group in 0..groups {
            // Window-major fill of the bounded patch matrix.
            for out_y in 0..output_height {
                let in_y_origin = (out_y * params.stride.0) as isize - params.padding.0 as isize;
                for out_x in 0..output_width {
                    let in_x_origin =
                        (out_x * params.stride.1) as isize - params.padding.1 as isize;
                    let window = out_y * output_width + out_x;
                    for filter_y in 0..filter_height {
                        let in_y = in_y_origin + (params.dilation.0 * filter_y) as isize;
                        for filter_x in 0..filter_width {
                            let in_x = in_x_origin + (params.dilation.1 * filter_x) as isize;
                            let inside = in_y >= 0
                                && in_y < input_shape[1] as isize
                                && in_x >= 0
                                && in_x < input_shape[2] as isize;
                            for in_channel in 0..filter_input_depth {
                                let row = (filter_y * filter_width + filter_x)
                                    * filter_input_depth
                                    + in_channel;
                                scratch.patches[row * patch_count + window] = if inside {
                                    i32::from(input_data[offset(
                                        input_shape,
                                        batch,
                                        in_y as usize,
                                        in_x as usize,
                                        group * filter_input_depth + in_channel,
                                    )]) + params.input_offset
                                } else {
                                    0
                                };
                            }
                        }
                    }
                }
            }

            // Reshape the group's filters into the bounded weight matrix.
            for group_channel in 0..filters_per_group {
                let out_channel = group * filters_per_group + group_channel;
                for filter_y in 0..filter_height {
                    for filter_x in 0..filter_width {
                        for in_channel in 0..filter_input_depth {
                            let row = (filter_y * filter_width + filter_x) * filter_input_depth
                                + in_channel;
                            scratch.weights[group_channel * volume + row] = filter_data[offset(
                                filter_shape,
                                out_channel,
                                filter_y,
                                filter_x,
                                in_channel,
                            )];
                        }
                    }
                }
            }

            perf.enter();
            integer_gemm(
                &scratch.weights,
                &scratch.patches,
                &mut scratch.products,
                filters_per_group,
                volume,
                patch_count,
            );
            perf.exit();

            scatter_products(
                params,
                output_multiplier,
                output_shift,
                bias,
                &scratch.products,
                batch,
                group,
                filters_per_group,
                output_shape,
                output,
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shape_basic() {
        let params = ConvParams::default();
        let shape = conv_output_shape(&[1, 5, 5, 2], &[1, 3, 3, 2], &params).unwrap();
        assert_eq!(shape, [1, 3, 3, 1]);
    }

    #[test]
    fn output_shape_strided_padded() {
        let params = ConvParams {
            stride: (2, 2),
            padding: (1, 1),
            ..ConvParams::default()
        };
        let shape = conv_output_shape(&[1, 7, 7, 3], &[4, 3, 3, 3], &params).unwrap();
        assert_eq!(shape, [1, 4, 4, 4]);
    }

    #[test]
    fn output_shape_dilated() {
        let params = ConvParams {
            dilation: (2, 2),
            ..ConvParams::default()
        };
        // Dilated 3x3 kernel spans 5 input positions.
        let shape = conv_output_shape(&[1, 5, 5, 1], &[1, 3, 3, 1], &params).unwrap();
        assert_eq!(shape, [1, 1, 1, 1]);
    }

    #[test]
    fn output_shape_rejects_oversized_kernel() {
        let params = ConvParams::default();
        let err = conv_output_shape(&[1, 2, 2, 1], &[1, 3, 3, 1], &params).unwrap_err();
        assert_eq!(err, ConvError::Geometry);
    }

    #[test]
    fn output_shape_rejects_bad_rank() {
        let params = ConvParams::default();
        let err = conv_output_shape(&[5, 5, 2], &[1, 3, 3, 2], &params).unwrap_err();
        assert_eq!(err, ConvError::Rank(3));
    }
}
