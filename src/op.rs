//! Operator lifecycle consumed by the owning runtime: one `prepare` call
//! resolving shapes and quantization parameters, then repeated `eval` calls
//! with fresh input data. Prepared parameters are read-only after `prepare`;
//! every precondition of the kernels is validated here, once, so a failed
//! evaluation can only mean the caller broke the contract between calls.

use crate::kernels::conv2d::{
    conv_output_shape, conv_per_channel, conv_per_channel_wide, ConvError, ConvParams,
    ConvStrategy, MAX_FILTER_VOLUME, MAX_OUTPUT_CHANNELS, MAX_PATCH_COUNT,
};
use crate::perf::{NoopCycles, PerfCounter};
use crate::tensor::TensorView;
use log::{debug, trace};

/// Everything the runtime resolves about one convolution operator before the
/// first evaluation.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    pub strategy: ConvStrategy,
    pub params: ConvParams,
    /// Per-output-channel rescale mantissas.
    pub output_multiplier: Vec<i32>,
    /// Per-output-channel rescale shifts.
    pub output_shift: Vec<i32>,
}

/// A validated convolution operator. Holds the shapes and quantization
/// tables fixed for its lifetime; evaluations only check that the supplied
/// tensors still match.
#[derive(Debug, Clone)]
pub struct PreparedConv2d {
    config: Conv2dConfig,
    input_shape: [usize; 4],
    filter_shape: [usize; 4],
    output_shape: [usize; 4],
}

impl PreparedConv2d {
    /// Validate shapes, grouping, quantization tables, geometry, and (for
    /// the tiled strategy) the scratch capacity, and fix them for the
    /// operator's lifetime.
    pub fn prepare(
        config: Conv2dConfig,
        input_shape: &[usize],
        filter_shape: &[usize],
    ) -> Result<Self, ConvError> {
        if input_shape.len() != 4 {
            return Err(ConvError::Rank(input_shape.len()));
        }
        if filter_shape.len() != 4 {
            return Err(ConvError::Rank(filter_shape.len()));
        }
        let params = &config.params;
        if params.quantized_activation_min > params.quantized_activation_max {
            return Err(ConvError::ActivationRange {
                min: params.quantized_activation_min,
                max: params.quantized_activation_max,
            });
        }

        let input_depth = input_shape[3];
        let filter_input_depth = filter_shape[3];
        if filter_input_depth == 0 || input_depth % filter_input_depth != 0 {
            return Err(ConvError::Grouping {
                input_depth,
                filter_input_depth,
            });
        }
        let groups = input_depth / filter_input_depth;
        let output_depth = filter_shape[0];
        if output_depth % groups != 0 {
            return Err(ConvError::GroupFilters {
                output_depth,
                groups,
            });
        }

        if config.output_multiplier.len() != output_depth {
            return Err(ConvError::PerChannelLen {
                got: config.output_multiplier.len(),
                expected: output_depth,
            });
        }
        if config.output_shift.len() != output_depth {
            return Err(ConvError::PerChannelLen {
                got: config.output_shift.len(),
                expected: output_depth,
            });
        }
        if config.strategy == ConvStrategy::WideAccumulator {
            for (channel, (&multiplier, &shift)) in config
                .output_multiplier
                .iter()
                .zip(config.output_shift.iter())
                .enumerate()
            {
                if multiplier < 0 || !(-31..8).contains(&shift) {
                    return Err(ConvError::WideRescaleDomain {
                        channel,
                        multiplier,
                        shift,
                    });
                }
            }
        }

        let output_shape = conv_output_shape(input_shape, filter_shape, params)?;

        if config.strategy == ConvStrategy::Im2colTiled {
            let volume = filter_shape[1] * filter_shape[2] * filter_input_depth;
            let patch_count = output_shape[1] * output_shape[2];
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
        }

        debug!(
            "conv2d prepared: strategy={:?} input={:?} filter={:?} output={:?} groups={} stride={:?} dilation={:?} padding={:?} offsets=({}, {}) activation=[{}, {}]",
            config.strategy,
            input_shape,
            filter_shape,
            output_shape,
            groups,
            params.stride,
            params.dilation,
            params.padding,
            params.input_offset,
            params.output_offset,
            params.quantized_activation_min,
            params.quantized_activation_max,
        );

        let mut fixed_input = [0usize; 4];
        fixed_input.copy_from_slice(input_shape);
        let mut fixed_filter = [0usize; 4];
        fixed_filter.copy_from_slice(filter_shape);
        Ok(Self {
            config,
            input_shape: fixed_input,
            filter_shape: fixed_filter,
            output_shape,
        })
    }

    pub fn strategy(&self) -> ConvStrategy {
        self.config.strategy
    }

    pub fn output_shape(&self) -> &[usize; 4] {
        &self.output_shape
    }

    /// Evaluate the 8-bit path into a caller-owned output buffer.
    pub fn eval(
        &self,
        input: &TensorView<i8>,
        filter: &TensorView<i8>,
        bias: Option<&[i32]>,
        output: &mut [i8],
    ) -> Result<(), ConvError> {
        self.eval_with_perf(input, filter, bias, output, &mut NoopCycles)
    }

    /// Evaluate the 8-bit path, accumulating MAC-region cycles into the
    /// supplied counter.
    pub fn eval_with_perf(
        &self,
        input: &TensorView<i8>,
        filter: &TensorView<i8>,
        bias: Option<&[i32]>,
        output: &mut [i8],
        perf: &mut dyn PerfCounter,
    ) -> Result<(), ConvError> {
        if self.config.strategy == ConvStrategy::WideAccumulator {
            return Err(ConvError::StrategyWidth(self.config.strategy));
        }
        self.check_eval_shapes(
            input.shape.as_ref(),
            filter.shape.as_ref(),
            bias.map(|b| b.len()),
            output.len(),
        )?;
        trace!(
            "conv2d eval: strategy={:?} output={:?}",
            self.config.strategy,
            self.output_shape
        );
        conv_per_channel(
            &self.config.params,
            &self.config.output_multiplier,
            &self.config.output_shift,
            input,
            filter,
            bias,
            &self.output_shape,
            output,
            self.config.strategy,
            perf,
        )
    }

    /// Evaluate the 16-bit wide-accumulator path.
    pub fn eval_wide(
        &self,
        input: &TensorView<i16>,
        filter: &TensorView<i8>,
        bias: Option<&[i64]>,
        output: &mut [i16],
    ) -> Result<(), ConvError> {
        self.eval_wide_with_perf(input, filter, bias, output, &mut NoopCycles)
    }

    pub fn eval_wide_with_perf(
        &self,
        input: &TensorView<i16>,
        filter: &TensorView<i8>,
        bias: Option<&[i64]>,
        output: &mut [i16],
        perf: &mut dyn PerfCounter,
    ) -> Result<(), ConvError> {
        if self.config.strategy != ConvStrategy::WideAccumulator {
            return Err(ConvError::StrategyWidth(self.config.strategy));
        }
        self.check_eval_shapes(
            input.shape.as_ref(),
            filter.shape.as_ref(),
            bias.map(|b| b.len()),
            output.len(),
        )?;
        trace!("conv2d eval: strategy=WideAccumulator output={:?}", self.output_shape);
        conv_per_channel_wide(
            &self.config.params,
            &self.config.output_multiplier,
            &self.config.output_shift,
            input,
            filter,
            bias,
            &self.output_shape,
            output,
            perf,
        );
        Ok(())
    }

    fn check_eval_shapes(
        &self,
        input_shape: &[usize],
        filter_shape: &[usize],
        bias_len: Option<usize>,
        output_len: usize,
    ) -> Result<(), ConvError> {
        if input_shape != self.input_shape.as_slice() {
            return Err(ConvError::ShapeMismatch {
                got: input_shape.to_vec(),
                expected: self.input_shape.to_vec(),
            });
        }
        if filter_shape != self.filter_shape.as_slice() {
            return Err(ConvError::ShapeMismatch {
                got: filter_shape.to_vec(),
                expected: self.filter_shape.to_vec(),
            });
        }
        if let Some(bias_len) = bias_len {
            if bias_len != self.filter_shape[0] {
                return Err(ConvError::BiasLen {
                    got: bias_len,
                    expected: self.filter_shape[0],
                });
            }
        }
        let needed: usize = self.output_shape.iter().product();
        if output_len != needed {
            return Err(ConvError::OutputLen {
                got: output_len,
                expected: needed,
            });
        }
        Ok(())
    }
}
