use bfconv::layout::BLOCK;
use bfconv::{
    create_convolution, DataType, EltwiseAlg, FormatTag, MemoryDesc, PostOps, Primitive,
    PrimitiveAttr, ScratchpadKey, SCRATCHPAD_ALIGN,
};
use bfconv_backend_ref_cpu::{RefBwdDataKernel, RefConvConf, RefConvolution, RefFwdKernel};
use bfconv_backend_tests::common::{engine, expect_unsupported, ConvProblem};

fn forward(problem: &ConvProblem, nthreads: usize) -> RefConvolution {
    create_convolution::<RefFwdKernel, RefBwdDataKernel>(
        &engine(nthreads),
        &problem.forward_desc().unwrap(),
        &PrimitiveAttr::default(),
        None,
    )
    .unwrap()
}

fn forward_conf(primitive: &RefConvolution) -> &RefConvConf {
    primitive.as_forward().expect("forward primitive").pd().config()
}

#[test]
fn splits_reduction_when_output_blocks_are_scarce() {
    let primitive = forward(&ConvProblem::new(1, 64, 16, &[12], &[3]), 4);
    let conf = forward_conf(&primitive);
    assert_eq!(conf.work_amount, 1);
    assert_eq!(conf.nthr_ic, 4);
    assert_eq!(conf.nthr, 4);
    assert!(!conf.with_src_transpose);

    let registry = primitive.scratchpad_registry();
    assert!(!registry.contains(ScratchpadKey::ConvTrSrc));
    let partial = registry
        .entry(ScratchpadKey::ConvPartialSums)
        .expect("partial sums booked");
    assert_eq!(partial.size, 4 * 10 * BLOCK * std::mem::size_of::<f32>());
}

#[test]
fn threads_follow_output_blocks_otherwise() {
    let primitive = forward(&ConvProblem::new(2, 16, 64, &[12], &[3]), 3);
    let conf = forward_conf(&primitive);
    assert_eq!(conf.work_amount, 8);
    assert_eq!(conf.nthr_ic, 1);
    assert_eq!(conf.nthr, 3);
    assert_eq!(primitive.scratchpad_size(), 0);
}

#[test]
fn books_aligned_regions_for_padding_and_bias() {
    let problem = ConvProblem::new(1, 20, 20, &[6, 6], &[3, 3])
        .padding(&[1, 1])
        .bias(DataType::F32);
    let primitive = forward(&problem, 2);
    let conf = forward_conf(&primitive);
    assert!(conf.with_src_transpose);
    assert_eq!(conf.padded_src_spatial(), [1, 8, 8]);

    let registry = primitive.scratchpad_registry();
    let bias = registry.entry(ScratchpadKey::ConvPaddedBias).unwrap();
    assert_eq!(bias.size, 32 * std::mem::size_of::<f32>());
    let tr_src = registry.entry(ScratchpadKey::ConvTrSrc).unwrap();
    assert_eq!(
        tr_src.size,
        conf.nthr * 2 * 64 * BLOCK * std::mem::size_of::<f32>()
    );
    for entry in registry.entries() {
        assert_eq!(entry.offset % SCRATCHPAD_ALIGN, 0);
    }
    assert!(bias.end() <= tr_src.offset);
}

#[test]
fn backward_data_needs_no_scratchpad() {
    let problem = ConvProblem::new(1, 20, 20, &[6, 6], &[3, 3]).padding(&[1, 1]);
    let primitive = create_convolution::<RefFwdKernel, RefBwdDataKernel>(
        &engine(4),
        &problem.backward_data_desc().unwrap(),
        &PrimitiveAttr::default(),
        None,
    )
    .unwrap();
    assert_eq!(primitive.scratchpad_size(), 0);
    let conf = primitive.as_backward_data().unwrap().pd().config();
    assert_eq!(conf.work_amount, 2);
    assert_eq!(conf.nthr, 2);
}

#[test]
fn rejects_grouped_channels_off_block() {
    let problem = ConvProblem::new(1, 16, 16, &[6], &[3]).groups(2);
    expect_unsupported(
        create_convolution::<RefFwdKernel, RefBwdDataKernel>(
            &engine(1),
            &problem.forward_desc().unwrap(),
            &PrimitiveAttr::default(),
            None,
        ),
        "8 channels per group",
    );
}

#[test]
fn rejects_padding_past_kernel_extent() {
    let problem = ConvProblem::new(1, 16, 16, &[6], &[1]).padding(&[1]);
    expect_unsupported(
        create_convolution::<RefFwdKernel, RefBwdDataKernel>(
            &engine(1),
            &problem.forward_desc().unwrap(),
            &PrimitiveAttr::default(),
            None,
        ),
        "padding 1 with a 1-wide kernel",
    );
}

#[test]
fn rejects_unsupported_attributes() {
    let problem = ConvProblem::new(1, 16, 16, &[6], &[3]);
    let mut chain = PostOps::new();
    chain.append_eltwise(EltwiseAlg::Tanh, 0.0, 0.0);
    chain.append_sum(1.0);
    expect_unsupported(
        create_convolution::<RefFwdKernel, RefBwdDataKernel>(
            &engine(1),
            &problem.forward_desc().unwrap(),
            &PrimitiveAttr::new().with_post_ops(chain),
            None,
        ),
        "eltwise before sum",
    );
    expect_unsupported(
        create_convolution::<RefFwdKernel, RefBwdDataKernel>(
            &engine(1),
            &problem.backward_data_desc().unwrap(),
            &PrimitiveAttr::new().with_output_scale(2.0),
            None,
        ),
        "scaled backward-data",
    );
}

#[test]
fn rejects_plain_layouts() {
    let problem = ConvProblem::new(1, 16, 16, &[6], &[3]);
    let desc = bfconv::ConvDesc::builder(bfconv::PropKind::ForwardInference, bfconv::AlgKind::Auto)
        .src(MemoryDesc::new(DataType::Bf16, &problem.src_dims()).with_format(FormatTag::Ncw))
        .weights(MemoryDesc::new(DataType::Bf16, &problem.weights_dims()))
        .dst(MemoryDesc::new(DataType::F32, &problem.dst_dims()))
        .build()
        .unwrap();
    expect_unsupported(
        create_convolution::<RefFwdKernel, RefBwdDataKernel>(
            &engine(1),
            &desc,
            &PrimitiveAttr::default(),
            None,
        ),
        "plain ncw source",
    );
}
