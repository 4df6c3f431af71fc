use bfconv::{
    create_convolution, ArgRole, BackwardDataKernel, ConvolutionPrimitive, CpuEngine, CpuIsa,
    DataType, ExecCtx, ForwardKernel, Primitive, PrimitiveAttr, ScratchpadMode,
};

use crate::common::{
    assert_close, engine, expect_invalid, expect_unsupported, seeded_rng, BwdDataCase,
    ConvProblem, ForwardCase, HostBuffer, ATOL, RTOL,
};

fn create_with<F: ForwardKernel, B: BackwardDataKernel>(
    engine: &CpuEngine,
    case: &ForwardCase,
    attr: &PrimitiveAttr,
) -> ConvolutionPrimitive<F, B> {
    create_convolution::<F, B>(engine, &case.desc, attr, None).unwrap()
}

fn padded_case(seed: u64) -> ForwardCase {
    let problem = ConvProblem::new(2, 24, 20, &[6, 7], &[3, 3])
        .padding(&[1, 1])
        .bias(DataType::F32);
    ForwardCase::new(problem, &mut seeded_rng(seed))
}

pub fn creation_requires_avx512_core<F: ForwardKernel, B: BackwardDataKernel>() {
    let case = padded_case(40);
    for isa in [CpuIsa::Any, CpuIsa::Sse41, CpuIsa::Avx2] {
        let engine = CpuEngine::new().with_isa(isa).with_threads(1);
        expect_unsupported(
            create_convolution::<F, B>(&engine, &case.desc, &PrimitiveAttr::default(), None),
            isa.name(),
        );
    }
}

pub fn repeated_executions_are_bit_identical<F: ForwardKernel, B: BackwardDataKernel>() {
    let case = padded_case(41);
    let primitive = create_with::<F, B>(&engine(3), &case, &PrimitiveAttr::default());

    let mut first = case.dst(0.0);
    primitive.execute(case.ctx(&mut first)).unwrap();
    let mut second = case.dst(0.0);
    primitive.execute(case.ctx(&mut second)).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
}

pub fn concurrent_executions_agree<F: ForwardKernel, B: BackwardDataKernel>() {
    let case = padded_case(42);
    let primitive = create_with::<F, B>(&engine(2), &case, &PrimitiveAttr::default());

    let outputs: Vec<Vec<u32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut dst = case.dst(0.0);
                    let mut scratchpad = primitive.create_scratchpad().unwrap();
                    primitive
                        .execute(case.ctx(&mut dst).scratchpad(&mut scratchpad))
                        .unwrap();
                    dst.to_bits()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("execution thread panicked"))
            .collect()
    });
    for output in &outputs[1..] {
        assert_eq!(output, &outputs[0]);
    }
}

/// Few output blocks and many input blocks, so a kernel may split the reduction.
pub fn reduction_heavy_problem_matches_reference<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(1, 64, 16, &[12], &[3]).padding(&[1]);
    let case = ForwardCase::new(problem, &mut seeded_rng(43));
    let expected = case.reference(1.0);

    for nthreads in [1, 4] {
        let primitive = create_with::<F, B>(&engine(nthreads), &case, &PrimitiveAttr::default());
        let mut dst = case.dst(0.0);
        primitive.execute(case.ctx(&mut dst)).unwrap();
        assert_close(&expected, &dst.plain(&case.dst_layout), ATOL, RTOL);

        let mut again = case.dst(0.0);
        primitive.execute(case.ctx(&mut again)).unwrap();
        assert_eq!(dst.to_bits(), again.to_bits(), "nthreads={nthreads}");
    }
}

pub fn user_scratchpad_mode<F: ForwardKernel, B: BackwardDataKernel>() {
    let case = padded_case(44);
    let engine = engine(2);
    let library = create_with::<F, B>(&engine, &case, &PrimitiveAttr::default());
    let user_attr = PrimitiveAttr::new().with_scratchpad_mode(ScratchpadMode::User);
    let user = create_with::<F, B>(&engine, &case, &user_attr);
    assert_eq!(library.scratchpad_size(), user.scratchpad_size());

    let mut expected = case.dst(0.0);
    library.execute(case.ctx(&mut expected)).unwrap();

    if user.scratchpad_size() > 0 {
        let mut dst = case.dst(0.0);
        expect_invalid(
            user.execute(case.ctx(&mut dst)),
            "user scratchpad mode without a scratchpad",
        );
    }
    let mut scratchpad = user.create_scratchpad().unwrap();
    assert_eq!(scratchpad.size(), user.scratchpad_size());
    let mut dst = case.dst(0.0);
    user.execute(case.ctx(&mut dst).scratchpad(&mut scratchpad)).unwrap();
    assert_eq!(expected.to_bits(), dst.to_bits());
}

/// A scratchpad left dirty by another call must not leak into the next result.
pub fn reused_scratchpad_keeps_no_state<F: ForwardKernel, B: BackwardDataKernel>() {
    let problem = ConvProblem::new(1, 64, 20, &[12], &[3])
        .padding(&[1])
        .bias(DataType::F32);
    let case = ForwardCase::new(problem.clone(), &mut seeded_rng(48));
    let other = ForwardCase::new(problem, &mut seeded_rng(49));
    let expected = case.reference(1.0);
    let engine = engine(4);

    let user_attr = PrimitiveAttr::new().with_scratchpad_mode(ScratchpadMode::User);
    let user = create_with::<F, B>(&engine, &case, &user_attr);
    let mut fresh = user.create_scratchpad().unwrap();
    let mut clean = case.dst(0.0);
    user.execute(case.ctx(&mut clean).scratchpad(&mut fresh)).unwrap();
    assert_close(&expected, &clean.plain(&case.dst_layout), ATOL, RTOL);

    let mut scratchpad = user.create_scratchpad().unwrap();
    let mut dst = other.dst(0.0);
    user.execute(other.ctx(&mut dst).scratchpad(&mut scratchpad)).unwrap();
    let mut reused = case.dst(0.0);
    user.execute(case.ctx(&mut reused).scratchpad(&mut scratchpad)).unwrap();
    assert_eq!(clean.to_bits(), reused.to_bits());

    // Same through the scratchpad a library-mode primitive keeps.
    let library = create_with::<F, B>(&engine, &case, &PrimitiveAttr::default());
    let mut dst = other.dst(0.0);
    library.execute(other.ctx(&mut dst)).unwrap();
    let mut reused = case.dst(0.0);
    library.execute(case.ctx(&mut reused)).unwrap();
    assert_eq!(clean.to_bits(), reused.to_bits());
}

pub fn foreign_scratchpad_is_rejected<F: ForwardKernel, B: BackwardDataKernel>() {
    let case = padded_case(45);
    let engine = engine(2);
    let first = create_with::<F, B>(&engine, &case, &PrimitiveAttr::default());
    let second = create_with::<F, B>(&engine, &case, &PrimitiveAttr::default());

    let mut scratchpad = first.create_scratchpad().unwrap();
    let mut dst = case.dst(0.0);
    expect_invalid(
        second.execute(case.ctx(&mut dst).scratchpad(&mut scratchpad)),
        "scratchpad of another primitive",
    );
}

pub fn malformed_arguments_are_invalid<F: ForwardKernel, B: BackwardDataKernel>() {
    let case = padded_case(46);
    let primitive = create_with::<F, B>(&engine(1), &case, &PrimitiveAttr::default());

    let mut dst = case.dst(0.0);
    let ctx = ExecCtx::new()
        .arg(ArgRole::Src, case.src.view())
        .arg_mut(ArgRole::Dst, dst.view_mut());
    expect_invalid(primitive.execute(ctx), "missing weights");

    let mut dst = case.dst(0.0);
    let ctx = ExecCtx::new()
        .arg(ArgRole::Src, case.src.view())
        .arg(ArgRole::Weights, case.weights.view())
        .arg_mut(ArgRole::Dst, dst.view_mut());
    expect_invalid(primitive.execute(ctx), "missing bias");

    let mut short = HostBuffer::filled(DataType::F32, case.dst_layout.logical_len(), 0.0);
    expect_invalid(primitive.execute(case.ctx(&mut short)), "dst without padded lanes");

    let mut wrong_type = HostBuffer::filled(DataType::Bf16, case.dst_layout.padded_len(), 0.0);
    expect_invalid(
        primitive.execute(case.ctx(&mut wrong_type)),
        "bf16 dst for an f32 primitive",
    );

    let bwd = BwdDataCase::new(ConvProblem::new(1, 16, 16, &[5], &[3]), &mut seeded_rng(47));
    let primitive =
        create_convolution::<F, B>(&engine(1), &bwd.desc, &PrimitiveAttr::default(), None)
            .unwrap();
    let mut diff_src = bwd.diff_src(0.0);
    let ctx = ExecCtx::new()
        .arg(ArgRole::Weights, bwd.weights.view())
        .arg_mut(ArgRole::DiffSrc, diff_src.view_mut());
    expect_invalid(primitive.execute(ctx), "missing diff-dst");
}
