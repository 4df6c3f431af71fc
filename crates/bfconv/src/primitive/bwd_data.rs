use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, debug_span, info};

use crate::attr::PrimitiveAttr;
use crate::cpu::CpuEngine;
use crate::desc::ConvDesc;
use crate::dtype::DataType;
use crate::env;
use crate::error::{ConvError, ConvResult};
use crate::exec::{ArgRole, ExecCtx};
use crate::kernel::{BackwardDataKernel, BwdDataArgs};
use crate::layout::{Direction, WeightsInterleave};
use crate::scratchpad::{Scratchpad, ScratchpadRegistry};

use super::pd::{check_arg, plan_scratchpad, unsupported, validate, ConvPdBase, FwdHint};
use super::{Primitive, PrimitiveKind};

/// Validated backward-data convolution.
pub struct ConvolutionBwdDataPd<K: BackwardDataKernel> {
    base: ConvPdBase,
    conf: K::Config,
}

impl<K: BackwardDataKernel> Clone for ConvolutionBwdDataPd<K> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            conf: self.conf.clone(),
        }
    }
}

impl<K: BackwardDataKernel> std::fmt::Debug for ConvolutionBwdDataPd<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionBwdDataPd")
            .field("base", &self.base)
            .field("conf", &self.conf)
            .finish()
    }
}

impl<K: BackwardDataKernel> ConvolutionBwdDataPd<K> {
    /// `hint` is the layout decision of the matching forward primitive, if one exists.
    pub fn new(
        engine: &CpuEngine,
        desc: &ConvDesc,
        attr: &PrimitiveAttr,
        hint: Option<&FwdHint>,
    ) -> ConvResult<Self> {
        let kind = PrimitiveKind::ConvolutionBackwardData;
        let layouts = validate(engine, desc, Direction::BackwardData, hint)
            .ok_or_else(|| unsupported(kind, K::IMPL_NAME))?;
        let conf = K::init_conf(desc, &layouts, attr, engine.nthreads())
            .ok_or_else(|| unsupported(kind, K::IMPL_NAME))?;
        let registry = plan_scratchpad(&conf, None)?;
        let base = ConvPdBase::new(desc, attr, layouts, WeightsInterleave::OutputPairs, registry);
        debug!(
            impl_name = K::IMPL_NAME,
            kind = kind.name(),
            problem = %desc.problem_string(),
            scratchpad_bytes = base.scratchpad_size(),
            "created convolution primitive"
        );
        Ok(Self { base, conf })
    }

    pub fn base(&self) -> &ConvPdBase {
        &self.base
    }

    pub fn desc(&self) -> &ConvDesc {
        self.base.desc()
    }

    /// Kernel configuration derived at creation.
    pub fn config(&self) -> &K::Config {
        &self.conf
    }

    /// Bytes a user-mode scratchpad must provide.
    pub fn scratchpad_size(&self) -> usize {
        self.base.scratchpad_size()
    }
}

/// Backward-data convolution primitive; owns its kernel and, in library mode, its
/// scratchpad.
pub struct ConvolutionBwdData<K: BackwardDataKernel> {
    pd: ConvolutionBwdDataPd<K>,
    kernel: K,
    scratchpad: Option<Mutex<Scratchpad>>,
}

impl<K: BackwardDataKernel> ConvolutionBwdData<K> {
    pub fn from_pd(pd: ConvolutionBwdDataPd<K>) -> ConvResult<Self> {
        let kernel = K::new(&pd.conf, pd.base.attr())?;
        let scratchpad = pd.base.library_scratchpad()?;
        Ok(Self {
            pd,
            kernel,
            scratchpad,
        })
    }

    /// Descriptor this primitive was created from.
    pub fn pd(&self) -> &ConvolutionBwdDataPd<K> {
        &self.pd
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }
}

impl<K: BackwardDataKernel> std::fmt::Debug for ConvolutionBwdData<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionBwdData")
            .field("impl_name", &K::IMPL_NAME)
            .field("conf", &self.pd.conf)
            .finish()
    }
}

impl<K: BackwardDataKernel> Primitive for ConvolutionBwdData<K> {
    fn create(
        engine: &CpuEngine,
        desc: &ConvDesc,
        attr: &PrimitiveAttr,
        hint: Option<&FwdHint>,
    ) -> ConvResult<Self> {
        Self::from_pd(ConvolutionBwdDataPd::new(engine, desc, attr, hint)?)
    }

    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::ConvolutionBackwardData
    }

    fn impl_name(&self) -> &'static str {
        K::IMPL_NAME
    }

    fn scratchpad_registry(&self) -> &Arc<ScratchpadRegistry> {
        self.pd.base.scratchpad_registry()
    }

    fn execute(&self, mut ctx: ExecCtx<'_>) -> ConvResult<()> {
        let span = debug_span!("conv_bwd_data", impl_name = K::IMPL_NAME);
        let _guard = span.enter();
        let started = env::verbose_enabled().then(Instant::now);

        let base = &self.pd.base;
        let desc = base.desc();
        let diff_dst = base.check_input(
            "diff_dst",
            ctx.require(ArgRole::DiffDst)?,
            DataType::Bf16,
            base.dst_layout().padded_len(),
        )?;
        let weights = base.check_input(
            "weights",
            ctx.require(ArgRole::Weights)?,
            DataType::Bf16,
            base.weights_layout().padded_len(),
        )?;
        let mut diff_src = ctx.take_output(ArgRole::DiffSrc)?;
        check_arg(
            "diff_src",
            diff_src.dtype(),
            diff_src.len(),
            desc.diff_src_desc().dtype(),
            base.src_layout().padded_len(),
        )?;
        let (Some(diff_dst), Some(weights)) = (diff_dst.as_bf16(), weights.as_bf16()) else {
            return Err(ConvError::invalid("diff_dst and weights must be bf16"));
        };

        base.with_scratchpad(ctx.take_scratchpad(), self.scratchpad.as_ref(), |grant| {
            let args = BwdDataArgs {
                diff_dst,
                weights,
                diff_src: diff_src.reborrow(),
            };
            self.kernel.run(args, grant)
        })?;

        if let Some(started) = started {
            info!(
                impl_name = K::IMPL_NAME,
                kind = self.kind().name(),
                problem = %desc.problem_string(),
                elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
                "exec"
            );
        }
        Ok(())
    }
}
