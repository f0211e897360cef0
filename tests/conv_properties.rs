// Behavioral properties of the quantized convolution kernels: padding,
// grouping, saturation, the tiled scratch capacity guard, and the end-to-end
// all-ones scenario.
use kwconv::kernels::conv2d::{
    conv_output_shape, conv_per_channel, ConvError, ConvParams, ConvStrategy, MAX_FILTER_VOLUME,
    MAX_OUTPUT_CHANNELS, MAX_PATCH_COUNT,
};
use kwconv::perf::NoopCycles;
use kwconv::tensor::TensorView;
use pretty_assertions::assert_eq;

// The 32-bit mantissa closest to 1.0, shift 0: an identity rescale.
const ONE: i32 = 0x7FFF_FFFF;

const ALL_NARROW_STRATEGIES: [ConvStrategy; 3] = [
    ConvStrategy::Direct,
    ConvStrategy::Im2colDynamic,
    ConvStrategy::Im2colTiled,
];

fn run(
    params: &ConvParams,
    input: &TensorView<i8>,
    filter: &TensorView<i8>,
    bias: Option<&[i32]>,
    strategy: ConvStrategy,
) -> (Vec<i8>, [usize; 4]) {
    let output_depth = filter.size(0);
    let multiplier = vec![ONE; output_depth];
    let shift = vec![0; output_depth];
    let output_shape =
        conv_output_shape(input.shape.as_ref(), filter.shape.as_ref(), params).unwrap();
    let mut output = vec![0i8; output_shape.iter().product()];
    conv_per_channel(
        params,
        &multiplier,
        &shift,
        input,
        filter,
        bias,
        &output_shape,
        &mut output,
        strategy,
        &mut NoopCycles,
    )
    .unwrap();
    (output, output_shape)
}

#[test]
fn end_to_end_all_ones() {
    // (1,5,5,2) ones against a (1,3,3,2) kernel of ones, identity rescale:
    // every output position sums 3*3*2 taps.
    let params = ConvParams::default();
    let input = TensorView::from_owned(vec![1i8; 50], vec![1, 5, 5, 2]);
    let filter = TensorView::from_owned(vec![1i8; 18], vec![1, 3, 3, 2]);
    let bias = [0i32];

    for strategy in ALL_NARROW_STRATEGIES {
        let (output, shape) = run(&params, &input, &filter, Some(&bias), strategy);
        assert_eq!(shape, [1, 3, 3, 1], "{strategy:?}");
        assert_eq!(output, vec![18i8; 9], "{strategy:?}");
    }
}

#[test]
fn padded_taps_contribute_the_zero_point() {
    // A 1x1 input under a 3x3 kernel with padding 1: only the center tap is
    // in bounds. Out-of-bounds taps behave as inputs sitting at the zero
    // point, whose offset-adjusted value is zero -- not as copies of the raw
    // edge value, and not as the bare offset.
    let params = ConvParams {
        padding: (1, 1),
        input_offset: -3,
        ..ConvParams::default()
    };
    let input = TensorView::from_owned(vec![7i8], vec![1, 1, 1, 1]);
    let weights: Vec<i8> = (1..=9).collect();
    let filter = TensorView::from_owned(weights, vec![1, 3, 3, 1]);

    for strategy in ALL_NARROW_STRATEGIES {
        let (output, shape) = run(&params, &input, &filter, None, strategy);
        assert_eq!(shape, [1, 1, 1, 1], "{strategy:?}");
        // (7 - 3) * center weight 5; the eight padded taps add nothing.
        assert_eq!(output, vec![20i8], "{strategy:?}");
    }
}

#[test]
fn grouped_channels_do_not_leak() {
    // input_depth 8, filter_input_depth 4: two groups. Group 0 reads input
    // channels [0,4), group 1 reads [4,8).
    let params = ConvParams::default();
    let channels: Vec<i8> = vec![1, 2, 3, 4, 5, 6, 7, 8];
    let input = TensorView::from_owned(channels.clone(), vec![1, 1, 1, 8]);
    let filter = TensorView::from_owned(vec![1i8; 8], vec![2, 1, 1, 4]);

    for strategy in ALL_NARROW_STRATEGIES {
        let (output, _) = run(&params, &input, &filter, None, strategy);
        assert_eq!(output, vec![10i8, 26], "{strategy:?}");
    }

    // Perturbing a group-1 input channel must leave group 0's output alone.
    let mut perturbed = channels;
    perturbed[6] = 50;
    let input = TensorView::from_owned(perturbed, vec![1, 1, 1, 8]);
    for strategy in ALL_NARROW_STRATEGIES {
        let (output, _) = run(&params, &input, &filter, None, strategy);
        assert_eq!(output, vec![10i8, 69], "{strategy:?}");
    }
}

#[test]
fn saturation_clamps_instead_of_wrapping() {
    let params = ConvParams::default();
    let input = TensorView::from_owned(vec![100i8; 4], vec![1, 1, 1, 4]);

    let filter = TensorView::from_owned(vec![127i8; 4], vec![1, 1, 1, 4]);
    for strategy in ALL_NARROW_STRATEGIES {
        let (output, _) = run(&params, &input, &filter, None, strategy);
        assert_eq!(output, vec![127i8], "{strategy:?} positive clamp");
    }

    let filter = TensorView::from_owned(vec![-127i8; 4], vec![1, 1, 1, 4]);
    for strategy in ALL_NARROW_STRATEGIES {
        let (output, _) = run(&params, &input, &filter, None, strategy);
        assert_eq!(output, vec![-128i8], "{strategy:?} negative clamp");
    }
}

fn run_tiled_raw(
    input_shape: [usize; 4],
    filter_shape: [usize; 4],
) -> (Result<(), ConvError>, Vec<i8>) {
    let params = ConvParams::default();
    let input = TensorView::from_owned(vec![1i8; input_shape.iter().product()], input_shape.to_vec());
    let filter =
        TensorView::from_owned(vec![1i8; filter_shape.iter().product()], filter_shape.to_vec());
    let output_depth = filter_shape[0];
    let multiplier = vec![ONE; output_depth];
    let shift = vec![0; output_depth];
    let output_shape = conv_output_shape(&input_shape, &filter_shape, &params).unwrap();
    let mut output = vec![99i8; output_shape.iter().product()];
    let result = conv_per_channel(
        &params,
        &multiplier,
        &shift,
        &input,
        &filter,
        None,
        &output_shape,
        &mut output,
        ConvStrategy::Im2colTiled,
        &mut NoopCycles,
    );
    (result, output)
}

#[test]
fn tiled_rejects_kernel_volume_one_over_the_limit() {
    let depth = MAX_FILTER_VOLUME + 1;
    let (result, output) = run_tiled_raw([1, 1, 1, depth], [1, 1, 1, depth]);
    assert!(matches!(result, Err(ConvError::ScratchCapacity { .. })));
    // Fail-fast: nothing may have been written.
    assert!(output.iter().all(|&v| v == 99));
}

#[test]
fn tiled_rejects_patch_count_one_over_the_limit() {
    // 65 * 64 output positions: one row past the 4096 budget.
    let (result, output) = run_tiled_raw([1, 65, 64, 1], [1, 1, 1, 1]);
    assert!(matches!(result, Err(ConvError::ScratchCapacity { .. })));
    assert!(output.iter().all(|&v| v == 99));
}

#[test]
fn tiled_rejects_output_channels_one_over_the_limit() {
    let channels = MAX_OUTPUT_CHANNELS + 1;
    let (result, output) = run_tiled_raw([1, 1, 1, 1], [channels, 1, 1, 1]);
    assert!(matches!(result, Err(ConvError::ScratchCapacity { .. })));
    assert!(output.iter().all(|&v| v == 99));
}

#[test]
fn tiled_accepts_problems_exactly_at_the_limits() {
    let (result, output) = run_tiled_raw([1, 1, 1, MAX_FILTER_VOLUME], [1, 1, 1, MAX_FILTER_VOLUME]);
    assert!(result.is_ok());
    // 512 ones saturate the identity rescale at the activation max.
    assert_eq!(output, vec![127i8]);

    let (result, _) = run_tiled_raw([1, 64, 64, 1], [1, 1, 1, 1]);
    assert!(result.is_ok());
    assert_eq!(64 * 64, MAX_PATCH_COUNT);

    let (result, _) = run_tiled_raw([1, 1, 1, 1], [MAX_OUTPUT_CHANNELS, 1, 1, 1]);
    assert!(result.is_ok());
}
