//! Validation and dispatch layer for blocked bf16 direct convolution.
//!
//! A [`ConvDesc`] describes the problem. Creating a primitive validates it against the bf16
//! whitelist, resolves the blocked memory layouts, lets the kernel derive its configuration and
//! books the scratchpad the configuration needs. Executing the primitive drives the kernel
//! and repairs the padded channel lanes of the destination.
//!
//! Compute kernels plug in through [`ForwardKernel`] and [`BackwardDataKernel`].

pub mod attr;
pub mod cpu;
pub mod desc;
pub mod dtype;
mod env;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod layout;
pub mod primitive;
pub mod scratchpad;

pub use attr::{EltwiseAlg, PostOp, PostOps, PrimitiveAttr, ScratchpadMode};
pub use cpu::{CpuEngine, CpuIsa};
pub use desc::{AlgKind, ConvDesc, ConvDescBuilder, MemoryDesc, PropKind};
pub use dtype::DataType;
pub use error::{ConvError, ConvResult, Status};
pub use exec::{ArgRole, ExecCtx, TensorView, TensorViewMut};
pub use kernel::{BackwardDataKernel, BwdDataArgs, ForwardArgs, ForwardKernel, KernelConfig};
pub use layout::{
    select_formats, ActivationLayout, ConvFormats, ConvLayouts, Direction, FormatTag,
    SpatialRank, WeightsInterleave, WeightsLayout, BLOCK,
};
pub use primitive::{
    create_convolution, ConvolutionBwdData, ConvolutionBwdDataPd, ConvolutionFwd,
    ConvolutionFwdPd, ConvolutionPrimitive, FwdHint, ImplRegistry, Primitive, PrimitiveKind,
};
pub use scratchpad::{
    Registrar, Scratchpad, ScratchpadGrant, ScratchpadKey, ScratchpadRegistry, SCRATCHPAD_ALIGN,
};
