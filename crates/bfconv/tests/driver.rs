mod common;

use bfconv::layout::BLOCK;
use bfconv::{
    create_convolution, ActivationLayout, ArgRole, ConvError, DataType, ExecCtx, Primitive,
    PrimitiveAttr, PrimitiveKind, TensorView,
};
use common::{backward_data_desc, engine, forward_desc, MockBwdData, MockFwd, GARBAGE};
use half::bf16;

type MockConvolution = bfconv::ConvolutionPrimitive<MockFwd, MockBwdData>;

fn create(desc: &bfconv::ConvDesc) -> MockConvolution {
    create_convolution::<MockFwd, MockBwdData>(&engine(2), desc, &PrimitiveAttr::default(), None)
        .unwrap()
}

/// Runs a forward primitive built from `forward_desc(mb, 20, oc, ..)` on zero inputs.
fn run_forward(mb: usize, oc: usize, bias: Option<TensorView<'_>>, dst: &mut Vec<f32>) {
    let bias_dt = bias.map(|bias| bias.dtype());
    let desc = forward_desc(mb, 20, oc, bias_dt, DataType::F32);
    let primitive = create(&desc);
    assert_eq!(primitive.kind(), PrimitiveKind::ConvolutionForward);
    assert_eq!(primitive.impl_name(), "mock:any");

    let src = vec![bf16::ZERO; mb * 32 * 10];
    let weights = vec![bf16::ZERO; oc.div_ceil(BLOCK) * 2 * 3 * BLOCK * BLOCK];
    let ctx = ExecCtx::new()
        .arg(ArgRole::Src, &src)
        .arg(ArgRole::Weights, &weights)
        .arg_mut(ArgRole::Dst, dst);
    let ctx = match bias {
        Some(bias) => ctx.arg(ArgRole::Bias, bias),
        None => ctx,
    };
    primitive.execute(ctx).unwrap();
}

fn assert_tail_zero(dst: &[f32], layout: &ActivationLayout) {
    let tail = if layout.has_padded_channels() {
        layout.channels % BLOCK
    } else {
        BLOCK
    };
    for (i, chunk) in dst.chunks_exact(layout.block_len()).enumerate() {
        let last_block = i % layout.channel_blocks() == layout.channel_blocks() - 1;
        for lanes in chunk.chunks_exact(BLOCK) {
            let (real, padding) = lanes.split_at(if last_block { tail } else { BLOCK });
            assert!(real.iter().all(|&v| v == GARBAGE), "chunk {i}: {lanes:?}");
            assert!(padding.iter().all(|&v| v == 0.0), "chunk {i}: {lanes:?}");
        }
    }
}

#[test]
fn partial_channel_block_is_zeroed_after_the_kernel() {
    for mb in [1, 2] {
        let layout = ActivationLayout::new(&[mb, 20, 8]);
        let mut dst = vec![-1.0f32; layout.padded_len()];
        run_forward(mb, 20, None, &mut dst);
        assert_tail_zero(&dst, &layout);
    }
}

#[test]
fn full_channel_blocks_keep_kernel_output() {
    let layout = ActivationLayout::new(&[2, 32, 8]);
    let mut dst = vec![-1.0f32; layout.padded_len()];
    run_forward(2, 32, None, &mut dst);
    assert!(dst.iter().all(|&v| v == GARBAGE));
}

#[test]
fn bias_is_staged_into_whole_blocks() {
    // The mock kernel fails the call unless it sees 32 channels with a zero tail.
    let layout = ActivationLayout::new(&[2, 20, 8]);
    let bias_f32 = vec![0.25f32; 20];
    let mut dst = vec![0.0f32; layout.padded_len()];
    run_forward(2, 20, Some(TensorView::from(&bias_f32)), &mut dst);
    assert_tail_zero(&dst, &layout);

    let bias_bf16 = vec![bf16::from_f32(0.25); 20];
    let mut dst = vec![0.0f32; layout.padded_len()];
    run_forward(2, 20, Some(TensorView::from(&bias_bf16)), &mut dst);
    assert_tail_zero(&dst, &layout);
}

#[test]
fn whole_block_bias_is_passed_through() {
    let bias = vec![0.25f32; 32];
    let mut dst = vec![0.0f32; ActivationLayout::new(&[2, 32, 8]).padded_len()];
    run_forward(2, 32, Some(TensorView::from(&bias)), &mut dst);
}

#[test]
fn bf16_destination_is_zero_padded() {
    let desc = forward_desc(2, 20, 20, None, DataType::Bf16);
    let primitive = create(&desc);
    let layout = ActivationLayout::new(desc.dst_desc().dims());
    let src = vec![bf16::ZERO; 2 * 32 * 10];
    let weights = vec![bf16::ZERO; 2 * 2 * 3 * BLOCK * BLOCK];
    let mut dst = vec![bf16::from_f32(-1.0); layout.padded_len()];
    primitive
        .execute(
            ExecCtx::new()
                .arg(ArgRole::Src, &src)
                .arg(ArgRole::Weights, &weights)
                .arg_mut(ArgRole::Dst, &mut dst),
        )
        .unwrap();
    let widened: Vec<f32> = dst.iter().map(|v| v.to_f32()).collect();
    assert_tail_zero(&widened, &layout);
}

#[test]
fn backward_data_leaves_padding_to_the_kernel() {
    let desc = backward_data_desc(2, 20, 32, DataType::F32);
    let primitive = create(&desc);
    assert_eq!(primitive.kind(), PrimitiveKind::ConvolutionBackwardData);
    assert!(primitive.as_backward_data().is_some());

    let layout = ActivationLayout::new(desc.diff_src_desc().dims());
    let diff_dst = vec![bf16::ZERO; 2 * 32 * 8];
    let weights = vec![bf16::ZERO; 2 * 2 * 3 * BLOCK * BLOCK];
    let mut diff_src = vec![0.0f32; layout.padded_len()];
    primitive
        .execute(
            ExecCtx::new()
                .arg(ArgRole::DiffDst, &diff_dst)
                .arg(ArgRole::Weights, &weights)
                .arg_mut(ArgRole::DiffSrc, &mut diff_src),
        )
        .unwrap();
    assert!(diff_src.iter().all(|&v| v == GARBAGE));
}

#[test]
fn per_call_arguments_are_checked() {
    let desc = forward_desc(2, 20, 20, Some(DataType::F32), DataType::F32);
    let primitive = create(&desc);
    let src = vec![bf16::ZERO; 2 * 32 * 10];
    let weights = vec![bf16::ZERO; 2 * 2 * 3 * BLOCK * BLOCK];
    let bias = vec![0.0f32; 20];
    let padded_dst = ActivationLayout::new(desc.dst_desc().dims()).padded_len();

    let mut dst = vec![0.0f32; padded_dst];
    let missing_src = ExecCtx::new()
        .arg(ArgRole::Weights, &weights)
        .arg(ArgRole::Bias, &bias)
        .arg_mut(ArgRole::Dst, &mut dst);
    assert!(matches!(primitive.execute(missing_src), Err(ConvError::InvalidArguments(_))));

    let short_src = &src[..src.len() - 1];
    let ctx = ExecCtx::new()
        .arg(ArgRole::Src, short_src)
        .arg(ArgRole::Weights, &weights)
        .arg(ArgRole::Bias, &bias)
        .arg_mut(ArgRole::Dst, &mut dst);
    assert!(matches!(primitive.execute(ctx), Err(ConvError::InvalidArguments(_))));

    let f32_weights = vec![0.0f32; weights.len()];
    let ctx = ExecCtx::new()
        .arg(ArgRole::Src, &src)
        .arg(ArgRole::Weights, &f32_weights)
        .arg(ArgRole::Bias, &bias)
        .arg_mut(ArgRole::Dst, &mut dst);
    assert!(matches!(primitive.execute(ctx), Err(ConvError::InvalidArguments(_))));

    let short_bias = &bias[..10];
    let ctx = ExecCtx::new()
        .arg(ArgRole::Src, &src)
        .arg(ArgRole::Weights, &weights)
        .arg(ArgRole::Bias, short_bias)
        .arg_mut(ArgRole::Dst, &mut dst);
    assert!(matches!(primitive.execute(ctx), Err(ConvError::InvalidArguments(_))));

    let ctx = ExecCtx::new()
        .arg(ArgRole::Src, &src)
        .arg(ArgRole::Weights, &weights)
        .arg(ArgRole::Bias, &bias)
        .arg_mut(ArgRole::Dst, &mut dst);
    primitive.execute(ctx).unwrap();
}
