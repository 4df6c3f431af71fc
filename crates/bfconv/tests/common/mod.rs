#![allow(dead_code)]

use bfconv::layout::BLOCK;
use bfconv::{
    AlgKind, BackwardDataKernel, BwdDataArgs, ConvDesc, ConvError, ConvLayouts, ConvResult,
    CpuEngine, CpuIsa, DataType, ForwardArgs, ForwardKernel, KernelConfig, MemoryDesc, PropKind,
    PrimitiveAttr, ScratchpadGrant, ScratchpadKey, TensorView, TensorViewMut,
};

/// Value the mock kernels write into every lane they own, padding included.
pub const GARBAGE: f32 = 3.0;

pub const TR_SRC_BYTES: usize = 100;
pub const PARTIAL_SUM_BYTES: usize = 192;

pub fn engine(nthreads: usize) -> CpuEngine {
    CpuEngine::new()
        .with_isa(CpuIsa::Avx512Core)
        .with_threads(nthreads)
}

/// 1D problem `mb x ic x 10 -> mb x oc x 8` with a width-3 kernel.
pub fn forward_desc(
    mb: usize,
    ic: usize,
    oc: usize,
    bias: Option<DataType>,
    dst: DataType,
) -> ConvDesc {
    let mut builder = ConvDesc::builder(PropKind::ForwardTraining, AlgKind::Direct)
        .src(MemoryDesc::new(DataType::Bf16, &[mb, ic, 10]))
        .weights(MemoryDesc::new(DataType::Bf16, &[oc, ic, 3]))
        .dst(MemoryDesc::new(dst, &[mb, oc, 8]));
    if let Some(dtype) = bias {
        builder = builder.bias(MemoryDesc::new(dtype, &[oc]));
    }
    builder.build().expect("well-formed forward descriptor")
}

pub fn backward_data_desc(mb: usize, ic: usize, oc: usize, diff_src: DataType) -> ConvDesc {
    ConvDesc::builder(PropKind::BackwardData, AlgKind::Direct)
        .diff_src(MemoryDesc::new(diff_src, &[mb, ic, 10]))
        .weights(MemoryDesc::new(DataType::Bf16, &[oc, ic, 3]))
        .diff_dst(MemoryDesc::new(DataType::Bf16, &[mb, oc, 8]))
        .build()
        .expect("well-formed backward-data descriptor")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConf {
    pub nthreads: usize,
    pub oc: usize,
    pub padded_bias: Option<usize>,
    pub tr_src_bytes: usize,
    pub partial_sum_bytes: usize,
}

impl KernelConfig for MockConf {
    fn nthreads(&self) -> usize {
        self.nthreads
    }

    fn padded_bias_channels(&self) -> Option<usize> {
        self.padded_bias
    }

    fn src_transpose_bytes(&self) -> usize {
        self.tr_src_bytes
    }

    fn reduction_bytes(&self) -> usize {
        self.partial_sum_bytes
    }
}

fn mock_conf(desc: &ConvDesc, nthreads: usize) -> MockConf {
    let padded = desc.oc().div_ceil(BLOCK) * BLOCK;
    MockConf {
        nthreads,
        oc: desc.oc(),
        padded_bias: (desc.with_bias() && desc.oc() % BLOCK != 0).then_some(padded),
        // Problems with one image use the scratchpad, larger batches run without it.
        tr_src_bytes: if desc.mb() == 1 { TR_SRC_BYTES } else { 0 },
        partial_sum_bytes: if desc.mb() == 1 { PARTIAL_SUM_BYTES } else { 0 },
    }
}

fn fill(dst: &mut TensorViewMut<'_>, value: f32) {
    match dst {
        TensorViewMut::F32(data) => data.fill(value),
        TensorViewMut::Bf16(data) => data.fill(half::bf16::from_f32(value)),
    }
}

/// Checks the staged bias and every scratchpad region, then writes [`GARBAGE`] everywhere.
#[derive(Debug)]
pub struct MockFwd {
    conf: MockConf,
}

fn check_bias(bias: Option<TensorView<'_>>, padded: Option<usize>, oc: usize) -> ConvResult<()> {
    let (Some(bias), Some(padded)) = (bias, padded) else {
        return Ok(());
    };
    if bias.len() != padded {
        return Err(ConvError::execution(format!(
            "bias has {} channels, expected {padded}",
            bias.len()
        )));
    }
    let tail_zero = match bias {
        TensorView::F32(data) => data[oc..].iter().all(|&v| v == 0.0),
        TensorView::Bf16(data) => data[oc..].iter().all(|v| v.to_f32() == 0.0),
    };
    if !tail_zero {
        return Err(ConvError::execution("padded bias tail is not zero"));
    }
    Ok(())
}

fn touch_regions(conf: &MockConf, grant: &mut ScratchpadGrant<'_>) -> ConvResult<()> {
    if conf.tr_src_bytes > 0 {
        let region: &mut [u8] = grant.take(ScratchpadKey::ConvTrSrc)?;
        if region.len() != conf.nthreads * conf.tr_src_bytes {
            return Err(ConvError::execution("source transpose region has the wrong size"));
        }
        region.fill(0xAB);
    }
    if conf.partial_sum_bytes > 0 {
        let region: &mut [f32] = grant.take(ScratchpadKey::ConvPartialSums)?;
        region.fill(f32::NAN);
    }
    Ok(())
}

impl ForwardKernel for MockFwd {
    type Config = MockConf;

    const IMPL_NAME: &'static str = "mock:any";

    fn init_conf(
        desc: &ConvDesc,
        _layouts: &ConvLayouts,
        _attr: &PrimitiveAttr,
        nthreads: usize,
    ) -> Option<MockConf> {
        // Seven images is the one shape the mock has no tiling for.
        (desc.mb() != 7).then(|| mock_conf(desc, nthreads))
    }

    fn new(conf: &MockConf, _attr: &PrimitiveAttr) -> ConvResult<Self> {
        Ok(Self { conf: conf.clone() })
    }

    fn run(&self, args: ForwardArgs<'_>, grant: &mut ScratchpadGrant<'_>) -> ConvResult<()> {
        let ForwardArgs { bias, mut dst, .. } = args;
        check_bias(bias, self.conf.padded_bias, self.conf.oc)?;
        touch_regions(&self.conf, grant)?;
        fill(&mut dst, GARBAGE);
        Ok(())
    }
}

/// Writes [`GARBAGE`] into every lane of diff-src.
#[derive(Debug)]
pub struct MockBwdData {
    conf: MockConf,
}

impl BackwardDataKernel for MockBwdData {
    type Config = MockConf;

    const IMPL_NAME: &'static str = "mock:any";

    fn init_conf(
        desc: &ConvDesc,
        _layouts: &ConvLayouts,
        _attr: &PrimitiveAttr,
        nthreads: usize,
    ) -> Option<MockConf> {
        Some(mock_conf(desc, nthreads))
    }

    fn new(conf: &MockConf, _attr: &PrimitiveAttr) -> ConvResult<Self> {
        Ok(Self { conf: conf.clone() })
    }

    fn run(&self, args: BwdDataArgs<'_>, grant: &mut ScratchpadGrant<'_>) -> ConvResult<()> {
        let BwdDataArgs { mut diff_src, .. } = args;
        touch_regions(&self.conf, grant)?;
        fill(&mut diff_src, GARBAGE);
        Ok(())
    }
}

/// Has no tiling for anything.
#[derive(Debug)]
pub struct DecliningFwd;

impl ForwardKernel for DecliningFwd {
    type Config = MockConf;

    const IMPL_NAME: &'static str = "declining:any";

    fn init_conf(
        _desc: &ConvDesc,
        _layouts: &ConvLayouts,
        _attr: &PrimitiveAttr,
        _nthreads: usize,
    ) -> Option<MockConf> {
        None
    }

    fn new(_conf: &MockConf, _attr: &PrimitiveAttr) -> ConvResult<Self> {
        Ok(Self)
    }

    fn run(&self, _args: ForwardArgs<'_>, _grant: &mut ScratchpadGrant<'_>) -> ConvResult<()> {
        Err(ConvError::execution("declining kernel cannot run"))
    }
}

/// Accepts every problem but fails to instantiate.
#[derive(Debug)]
pub struct FailingFwd;

impl ForwardKernel for FailingFwd {
    type Config = MockConf;

    const IMPL_NAME: &'static str = "failing:any";

    fn init_conf(
        desc: &ConvDesc,
        _layouts: &ConvLayouts,
        _attr: &PrimitiveAttr,
        nthreads: usize,
    ) -> Option<MockConf> {
        Some(mock_conf(desc, nthreads))
    }

    fn new(_conf: &MockConf, _attr: &PrimitiveAttr) -> ConvResult<Self> {
        Err(ConvError::execution("kernel generation failed"))
    }

    fn run(&self, _args: ForwardArgs<'_>, _grant: &mut ScratchpadGrant<'_>) -> ConvResult<()> {
        Ok(())
    }
}
