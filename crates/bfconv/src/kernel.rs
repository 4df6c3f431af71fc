//! Contract between the dispatch layer and a compute kernel.
//!
//! A kernel derives its own configuration from a validated descriptor, is instantiated once
//! per primitive from that configuration, and is then run any number of times. The dispatch
//! layer never looks inside the configuration beyond [`KernelConfig`].

use std::fmt;

use half::bf16;

use crate::attr::PrimitiveAttr;
use crate::desc::ConvDesc;
use crate::error::ConvResult;
use crate::exec::{TensorView, TensorViewMut};
use crate::layout::ConvLayouts;
use crate::scratchpad::ScratchpadGrant;

/// What the dispatch layer may ask of a finalized kernel configuration.
pub trait KernelConfig: fmt::Debug + Send + Sync {
    /// Threads the kernel will fan out to.
    fn nthreads(&self) -> usize;

    /// Channel count of the padded bias buffer when the bias must be staged, `None` otherwise.
    fn padded_bias_channels(&self) -> Option<usize> {
        None
    }

    /// Bytes of staged source each thread needs; 0 when the source is read in place.
    fn src_transpose_bytes(&self) -> usize {
        0
    }

    /// Bytes of partial sums each thread needs; 0 without a split reduction.
    fn reduction_bytes(&self) -> usize {
        0
    }
}

/// Tensors handed to a forward kernel. All activations and weights are in the blocked
/// layouts recorded in the primitive descriptor.
#[derive(Debug)]
pub struct ForwardArgs<'a> {
    pub src: &'a [bf16],
    pub weights: &'a [bf16],
    /// Already padded to whole channel blocks when the configuration asked for it.
    pub bias: Option<TensorView<'a>>,
    pub dst: TensorViewMut<'a>,
}

#[derive(Debug)]
pub struct BwdDataArgs<'a> {
    pub diff_dst: &'a [bf16],
    pub weights: &'a [bf16],
    pub diff_src: TensorViewMut<'a>,
}

pub trait ForwardKernel: Sized + Send + Sync {
    type Config: KernelConfig + Clone;

    /// Implementation name reported by primitives built on this kernel.
    const IMPL_NAME: &'static str;

    /// `None` when the kernel has no tiling for this problem.
    fn init_conf(
        desc: &ConvDesc,
        layouts: &ConvLayouts,
        attr: &PrimitiveAttr,
        nthreads: usize,
    ) -> Option<Self::Config>;

    fn new(conf: &Self::Config, attr: &PrimitiveAttr) -> ConvResult<Self>;

    fn run(&self, args: ForwardArgs<'_>, scratchpad: &mut ScratchpadGrant<'_>) -> ConvResult<()>;
}

pub trait BackwardDataKernel: Sized + Send + Sync {
    type Config: KernelConfig + Clone;

    const IMPL_NAME: &'static str;

    fn init_conf(
        desc: &ConvDesc,
        layouts: &ConvLayouts,
        attr: &PrimitiveAttr,
        nthreads: usize,
    ) -> Option<Self::Config>;

    fn new(conf: &Self::Config, attr: &PrimitiveAttr) -> ConvResult<Self>;

    fn run(&self, args: BwdDataArgs<'_>, scratchpad: &mut ScratchpadGrant<'_>) -> ConvResult<()>;
}
