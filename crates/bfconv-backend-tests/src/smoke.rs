use bfconv::{
    create_convolution, BackwardDataKernel, ConvDesc, ConvolutionBwdDataPd, ConvolutionFwdPd,
    ConvolutionPrimitive, DataType, EltwiseAlg, ForwardKernel, PostOps, Primitive, PrimitiveAttr,
    PrimitiveKind, BLOCK,
};

use crate::common::{
    assert_close, engine, expect_unsupported, random_bf16, seeded_rng, BwdDataCase, ConvProblem,
    ForwardCase, ATOL, BF16_TOL, RTOL,
};

fn create<F: ForwardKernel, B: BackwardDataKernel>(
    desc: &ConvDesc,
    attr: &PrimitiveAttr,
    nthreads: usize,
) -> ConvolutionPrimitive<F, B> {
    create_convolution::<F, B>(&engine(nthreads), desc, attr, None)
        .unwrap_or_else(|err| panic!("{}: {err}", desc.problem_string()))
}

fn tolerance(dtype: DataType) -> (f32, f32) {
    match dtype {
        DataType::Bf16 => (BF16_TOL, BF16_TOL),
        _ => (ATOL, RTOL),
    }
}

fn check_forward<F: ForwardKernel, B: BackwardDataKernel>(problem: ConvProblem, seed: u64) {
    let mut rng = seeded_rng(seed);
    let case = ForwardCase::new(problem, &mut rng);
    let primitive = create::<F, B>(&case.desc, &PrimitiveAttr::default(), 2);
    assert_eq!(primitive.kind(), PrimitiveKind::ConvolutionForward);

    let mut dst = case.dst(0.0);
    primitive.execute(case.ctx(&mut dst)).unwrap();

    let (atol, rtol) = tolerance(case.problem.out_dt);
    assert_close(&case.reference(1.0), &dst.plain(&case.dst_layout), atol, rtol);
}

fn check_backward_data<F: ForwardKernel, B: BackwardDataKernel>(problem: ConvProblem, seed: u64) {
    let mut rng = seeded_rng(seed);
    let case = BwdDataCase::new(problem, &mut rng);
    let primitive = create::<F, B>(&case.desc, &PrimitiveAttr::default(), 2);
    assert_eq!(primitive.kind(), PrimitiveKind::ConvolutionBackwardData);

    let mut diff_src = case.diff_src(0.0);
    primitive.execute(case.ctx(&mut diff_src)).unwrap();

    let (atol, rtol) = tolerance(case.problem.out_dt);
    assert_close(
        &case.reference(),
        &diff_src.plain(&case.diff_src_layout),
        atol,
        rtol,
    );
}

pub fn forward_1d_full_blocks<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 20, 32, &[10], &[3]);
    let desc = problem.forward_desc().unwrap();
    assert_eq!(desc.dst_spatial(), &[8]);

    let mut rng = seeded_rng(11);
    let case = ForwardCase::new(problem, &mut rng);
    assert!(!case.dst_layout.has_padded_channels());
    let primitive = create::<F, B>(&case.desc, &PrimitiveAttr::default(), 2);
    assert!(!primitive.impl_name().is_empty());

    let mut dst = case.dst(0.0);
    primitive.execute(case.ctx(&mut dst)).unwrap();
    assert_close(&case.reference(1.0), &dst.plain(&case.dst_layout), ATOL, RTOL);
}

pub fn forward_1d_partial_block_zeroes_tail<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 20, 20, &[10], &[3]);
    let mut rng = seeded_rng(12);
    let case = ForwardCase::new(problem, &mut rng);
    assert!(case.dst_layout.has_padded_channels());
    let primitive = create::<F, B>(&case.desc, &PrimitiveAttr::default(), 2);

    let mut dst = case.dst(7.0);
    primitive.execute(case.ctx(&mut dst)).unwrap();

    let values = dst.to_f32();
    let layout = case.dst_layout;
    let last_block = layout.channel_blocks() - 1;
    for n in 0..layout.mb {
        for s in 0..layout.spatial_size() {
            let chunk = n * layout.channel_blocks() + last_block;
            let base = (chunk * layout.spatial_size() + s) * BLOCK;
            for lane in layout.channels % BLOCK..BLOCK {
                assert_eq!(values[base + lane], 0.0, "n={n} s={s} lane={lane}");
            }
        }
    }
    assert_close(&case.reference(1.0), &dst.plain(&layout), ATOL, RTOL);
}

pub fn forward_2d_strided_padded_with_bias<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 16, 24, &[7, 6], &[3, 3])
        .strides(&[2, 2])
        .padding(&[1, 1])
        .bias(DataType::F32);
    check_forward::<F, B>(problem, 21);
}

pub fn forward_2d_dilated_bf16_bias<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(1, 24, 17, &[9, 8], &[3, 2])
        .dilation(&[2, 3])
        .padding(&[1, 1])
        .bias(DataType::Bf16);
    check_forward::<F, B>(problem, 22);
}

pub fn forward_3d<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(1, 8, 16, &[4, 5, 4], &[3, 3, 3])
        .padding(&[1, 1, 1])
        .bias(DataType::F32);
    check_forward::<F, B>(problem, 23);
}

pub fn forward_grouped<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 32, 32, &[6, 6], &[3, 3])
        .groups(2)
        .bias(DataType::F32);
    check_forward::<F, B>(problem, 24);
}

pub fn forward_bf16_dst<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 20, 20, &[12], &[5])
        .padding(&[2])
        .out_dt(DataType::Bf16);
    check_forward::<F, B>(problem, 25);
}

pub fn forward_post_ops<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 16, 32, &[5, 5], &[3, 3])
        .padding(&[1, 1])
        .bias(DataType::F32);
    let mut rng = seeded_rng(26);
    let case = ForwardCase::new(problem, &mut rng);
    let prev = random_bf16(&mut rng, case.dst_layout.logical_len());

    let mut post_ops = PostOps::new();
    post_ops.append_sum(1.0);
    post_ops.append_eltwise(EltwiseAlg::Relu, 0.0, 0.0);
    let attr = PrimitiveAttr::new()
        .with_output_scale(0.5)
        .with_post_ops(post_ops);
    let primitive = create::<F, B>(&case.desc, &attr, 2);

    let mut dst = case.dst_from_plain(&prev);
    primitive.execute(case.ctx(&mut dst)).unwrap();

    let expected: Vec<f32> = case
        .reference(0.5)
        .iter()
        .zip(&prev)
        .map(|(value, prev)| EltwiseAlg::Relu.apply(value + prev, 0.0, 0.0))
        .collect();
    assert_close(&expected, &dst.plain(&case.dst_layout), ATOL, RTOL);
}

pub fn backward_data_1d<F: ForwardKernel, B: BackwardDataKernel>() {
    check_backward_data::<F, B>(ConvProblem::new(2, 20, 32, &[10], &[3]), 31);
}

pub fn backward_data_2d_strided_padded<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 24, 20, &[9, 7], &[3, 3])
        .strides(&[2, 2])
        .padding(&[1, 1]);
    check_backward_data::<F, B>(problem, 32);
}

pub fn backward_data_3d_dilated<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(1, 16, 8, &[5, 6, 5], &[2, 3, 2])
        .dilation(&[2, 1, 2])
        .padding(&[1, 1, 1]);
    check_backward_data::<F, B>(problem, 33);
}

pub fn backward_data_grouped_bf16_diff_src<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(1, 32, 64, &[6, 6], &[3, 3])
        .groups(2)
        .padding(&[1, 1])
        .out_dt(DataType::Bf16);
    check_backward_data::<F, B>(problem, 34);
}

pub fn direction_mismatch_is_unsupported<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(2, 20, 32, &[10], &[3]);
    let engine = engine(1);
    let attr = PrimitiveAttr::default();
    let fwd_desc = problem.forward_desc().unwrap();
    let bwd_desc = problem.backward_data_desc().unwrap();

    expect_unsupported(
        ConvolutionBwdDataPd::<B>::new(&engine, &fwd_desc, &attr, None),
        "backward-data over a forward descriptor",
    );
    expect_unsupported(
        ConvolutionFwdPd::<F>::new(&engine, &bwd_desc, &attr),
        "forward over a backward-data descriptor",
    );
}

pub fn backward_data_follows_forward_hint<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(1, 16, 16, &[6, 6], &[3, 3]).padding(&[1, 1]);
    let engine = engine(2);
    let attr = PrimitiveAttr::default();
    let fwd = ConvolutionFwdPd::<F>::new(&engine, &problem.forward_desc().unwrap(), &attr).unwrap();
    let hint = fwd.hint();
    let bwd = ConvolutionBwdDataPd::<B>::new(
        &engine,
        &problem.backward_data_desc().unwrap(),
        &attr,
        Some(&hint),
    )
    .unwrap();
    assert_eq!(bwd.base().layouts().src, hint.data);
    assert_eq!(bwd.base().layouts().dst, hint.data);
}
