//! Convolution primitives: creation (validation, layout selection, kernel configuration,
//! scratchpad planning) and execution against a kernel.

mod bwd_data;
mod fwd;
mod pd;
pub mod registry;

use std::fmt;
use std::sync::Arc;

pub use bwd_data::{ConvolutionBwdData, ConvolutionBwdDataPd};
pub use fwd::{ConvolutionFwd, ConvolutionFwdPd};
pub use pd::{ConvPdBase, FwdHint, REQUIRED_ISA};
pub use registry::{create_primitive, register_primitive, ImplRegistry};

use crate::attr::PrimitiveAttr;
use crate::cpu::CpuEngine;
use crate::desc::{ConvDesc, PropKind};
use crate::error::ConvResult;
use crate::exec::ExecCtx;
use crate::kernel::{BackwardDataKernel, ForwardKernel};
use crate::scratchpad::{Scratchpad, ScratchpadRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    ConvolutionForward,
    ConvolutionBackwardData,
}

impl PrimitiveKind {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::ConvolutionForward => "convolution_fwd",
            PrimitiveKind::ConvolutionBackwardData => "convolution_bwd_data",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A created convolution that can be executed any number of times, concurrently when each
/// call brings its own context and scratchpad.
pub trait Primitive: Send + Sync {
    /// Fails with `Unsupported` when this implementation cannot handle the descriptor.
    fn create(
        engine: &CpuEngine,
        desc: &ConvDesc,
        attr: &PrimitiveAttr,
        hint: Option<&FwdHint>,
    ) -> ConvResult<Self>
    where
        Self: Sized;

    fn kind(&self) -> PrimitiveKind;

    /// Name the implementation registered under, e.g. `ref_bf16:any`.
    fn impl_name(&self) -> &'static str;

    fn scratchpad_registry(&self) -> &Arc<ScratchpadRegistry>;

    /// Zero when execution needs no scratchpad at all.
    fn scratchpad_size(&self) -> usize {
        self.scratchpad_registry().size()
    }

    /// Allocates a scratchpad bound to this primitive.
    fn create_scratchpad(&self) -> ConvResult<Scratchpad> {
        Scratchpad::new(Arc::clone(self.scratchpad_registry()))
    }

    /// Runs the convolution. Without a scratchpad in `ctx`, library mode uses the one the
    /// primitive allocated at creation.
    fn execute(&self, ctx: ExecCtx<'_>) -> ConvResult<()>;
}

/// A convolution of either direction, built from a pair of kernels.
pub enum ConvolutionPrimitive<F: ForwardKernel, B: BackwardDataKernel> {
    Forward(ConvolutionFwd<F>),
    BackwardData(ConvolutionBwdData<B>),
}

impl<F: ForwardKernel, B: BackwardDataKernel> fmt::Debug for ConvolutionPrimitive<F, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvolutionPrimitive::Forward(p) => f.debug_tuple("Forward").field(p).finish(),
            ConvolutionPrimitive::BackwardData(p) => {
                f.debug_tuple("BackwardData").field(p).finish()
            }
        }
    }
}

impl<F: ForwardKernel, B: BackwardDataKernel> ConvolutionPrimitive<F, B> {
    /// The forward primitive, if that is the direction the descriptor asked for.
    pub fn as_forward(&self) -> Option<&ConvolutionFwd<F>> {
        match self {
            ConvolutionPrimitive::Forward(p) => Some(p),
            ConvolutionPrimitive::BackwardData(_) => None,
        }
    }

    pub fn as_backward_data(&self) -> Option<&ConvolutionBwdData<B>> {
        match self {
            ConvolutionPrimitive::Forward(_) => None,
            ConvolutionPrimitive::BackwardData(p) => Some(p),
        }
    }
}

impl<F: ForwardKernel, B: BackwardDataKernel> Primitive for ConvolutionPrimitive<F, B> {
    fn create(
        engine: &CpuEngine,
        desc: &ConvDesc,
        attr: &PrimitiveAttr,
        hint: Option<&FwdHint>,
    ) -> ConvResult<Self> {
        create_convolution(engine, desc, attr, hint)
    }

    fn kind(&self) -> PrimitiveKind {
        match self {
            ConvolutionPrimitive::Forward(p) => p.kind(),
            ConvolutionPrimitive::BackwardData(p) => p.kind(),
        }
    }

    fn impl_name(&self) -> &'static str {
        match self {
            ConvolutionPrimitive::Forward(p) => p.impl_name(),
            ConvolutionPrimitive::BackwardData(p) => p.impl_name(),
        }
    }

    fn scratchpad_registry(&self) -> &Arc<ScratchpadRegistry> {
        match self {
            ConvolutionPrimitive::Forward(p) => p.scratchpad_registry(),
            ConvolutionPrimitive::BackwardData(p) => p.scratchpad_registry(),
        }
    }

    fn execute(&self, ctx: ExecCtx<'_>) -> ConvResult<()> {
        match self {
            ConvolutionPrimitive::Forward(p) => p.execute(ctx),
            ConvolutionPrimitive::BackwardData(p) => p.execute(ctx),
        }
    }
}

/// Creates the primitive matching the descriptor's propagation kind.
pub fn create_convolution<F: ForwardKernel, B: BackwardDataKernel>(
    engine: &CpuEngine,
    desc: &ConvDesc,
    attr: &PrimitiveAttr,
    hint: Option<&FwdHint>,
) -> ConvResult<ConvolutionPrimitive<F, B>> {
    match desc.prop_kind() {
        PropKind::ForwardTraining | PropKind::ForwardInference => Ok(ConvolutionPrimitive::Forward(
            ConvolutionFwd::create(engine, desc, attr, hint)?,
        )),
        PropKind::BackwardData => Ok(ConvolutionPrimitive::BackwardData(
            ConvolutionBwdData::create(engine, desc, attr, hint)?,
        )),
        PropKind::BackwardWeights | PropKind::BackwardBias => {
            Err(pd::unsupported(PrimitiveKind::ConvolutionBackwardData, F::IMPL_NAME))
        }
    }
}
