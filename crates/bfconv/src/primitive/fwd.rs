use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytemuck::Pod;
use tracing::{debug, debug_span, info};

use crate::attr::PrimitiveAttr;
use crate::cpu::CpuEngine;
use crate::desc::ConvDesc;
use crate::dtype::DataType;
use crate::env;
use crate::error::{ConvError, ConvResult};
use crate::exec::{ArgRole, ExecCtx, TensorView, TensorViewMut};
use crate::kernel::{ForwardArgs, ForwardKernel, KernelConfig};
use crate::layout::{zero_pad_channels, Direction, WeightsInterleave};
use crate::scratchpad::{Scratchpad, ScratchpadGrant, ScratchpadKey, ScratchpadRegistry};

use super::pd::{check_arg, plan_scratchpad, unsupported, validate, ConvPdBase, FwdHint};
use super::{Primitive, PrimitiveKind};

/// Validated forward convolution together with the kernel configuration derived for it.
pub struct ConvolutionFwdPd<K: ForwardKernel> {
    base: ConvPdBase,
    conf: K::Config,
}

impl<K: ForwardKernel> Clone for ConvolutionFwdPd<K> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            conf: self.conf.clone(),
        }
    }
}

impl<K: ForwardKernel> std::fmt::Debug for ConvolutionFwdPd<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionFwdPd")
            .field("base", &self.base)
            .field("conf", &self.conf)
            .finish()
    }
}

impl<K: ForwardKernel> ConvolutionFwdPd<K> {
    pub fn new(engine: &CpuEngine, desc: &ConvDesc, attr: &PrimitiveAttr) -> ConvResult<Self> {
        let kind = PrimitiveKind::ConvolutionForward;
        let layouts = validate(engine, desc, Direction::Forward, None)
            .ok_or_else(|| unsupported(kind, K::IMPL_NAME))?;
        let conf = K::init_conf(desc, &layouts, attr, engine.nthreads())
            .ok_or_else(|| unsupported(kind, K::IMPL_NAME))?;
        let registry = plan_scratchpad(&conf, desc.bias_desc().map(|bias| bias.dtype()))?;
        let base = ConvPdBase::new(desc, attr, layouts, WeightsInterleave::InputPairs, registry);
        debug!(
            impl_name = K::IMPL_NAME,
            kind = kind.name(),
            problem = %desc.problem_string(),
            scratchpad_bytes = base.scratchpad_size(),
            "created convolution primitive"
        );
        Ok(Self { base, conf })
    }

    /// State shared with backward-data: layouts, geometry and scratchpad bookings.
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

    pub fn scratchpad_size(&self) -> usize {
        self.base.scratchpad_size()
    }

    /// Layout decision offered to a backward-data primitive of the same problem.
    pub fn hint(&self) -> FwdHint {
        self.base.hint()
    }

    /// Element type written to the destination.
    pub fn dst_dtype(&self) -> DataType {
        self.desc().dst_desc().dtype()
    }
}

/// Forward convolution primitive; owns its kernel and, in library mode, its scratchpad.
pub struct ConvolutionFwd<K: ForwardKernel> {
    pd: ConvolutionFwdPd<K>,
    kernel: K,
    scratchpad: Option<Mutex<Scratchpad>>,
}

impl<K: ForwardKernel> ConvolutionFwd<K> {
    /// Instantiates the kernel and allocates the library-mode scratchpad. Execution never
    /// allocates scratchpad memory after this.
    pub fn from_pd(pd: ConvolutionFwdPd<K>) -> ConvResult<Self> {
        let kernel = K::new(&pd.conf, pd.base.attr())?;
        let scratchpad = pd.base.library_scratchpad()?;
        Ok(Self {
            pd,
            kernel,
            scratchpad,
        })
    }

    /// Descriptor this primitive was created from.
    pub fn pd(&self) -> &ConvolutionFwdPd<K> {
        &self.pd
    }

    /// Kernel instantiated for this primitive.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }
}

impl<K: ForwardKernel> std::fmt::Debug for ConvolutionFwd<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionFwd")
            .field("impl_name", &K::IMPL_NAME)
            .field("conf", &self.pd.conf)
            .finish()
    }
}

fn copy_zero_extended<T: Copy + Default>(src: &[T], dst: &mut [T]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(T::default());
}

fn stage_padded<'g, T: Pod + Default>(
    raw: &[T],
    channels: usize,
    grant: &mut ScratchpadGrant<'g>,
) -> ConvResult<&'g [T]> {
    let region: &'g mut [T] = grant.take(ScratchpadKey::ConvPaddedBias)?;
    copy_zero_extended(&raw[..channels], region);
    Ok(region)
}

/// Copies the bias into the padded-bias region so the kernel always reads whole blocks.
fn stage_bias<'g>(
    raw: TensorView<'_>,
    channels: usize,
    grant: &mut ScratchpadGrant<'g>,
) -> ConvResult<TensorView<'g>> {
    match raw {
        TensorView::F32(data) => stage_padded(data, channels, grant).map(TensorView::F32),
        TensorView::Bf16(data) => stage_padded(data, channels, grant).map(TensorView::Bf16),
    }
}

impl<K: ForwardKernel> Primitive for ConvolutionFwd<K> {
    fn create(
        engine: &CpuEngine,
        desc: &ConvDesc,
        attr: &PrimitiveAttr,
        _hint: Option<&FwdHint>,
    ) -> ConvResult<Self> {
        Self::from_pd(ConvolutionFwdPd::new(engine, desc, attr)?)
    }

    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::ConvolutionForward
    }

    fn impl_name(&self) -> &'static str {
        K::IMPL_NAME
    }

    fn scratchpad_registry(&self) -> &Arc<ScratchpadRegistry> {
        self.pd.base.scratchpad_registry()
    }

    fn execute(&self, mut ctx: ExecCtx<'_>) -> ConvResult<()> {
        let span = debug_span!("conv_fwd", impl_name = K::IMPL_NAME);
        let _guard = span.enter();
        let started = env::verbose_enabled().then(Instant::now);

        let base = &self.pd.base;
        let desc = base.desc();
        let src = base.check_input(
            "src",
            ctx.require(ArgRole::Src)?,
            DataType::Bf16,
            base.src_layout().padded_len(),
        )?;
        let weights = base.check_input(
            "weights",
            ctx.require(ArgRole::Weights)?,
            DataType::Bf16,
            base.weights_layout().padded_len(),
        )?;
        let bias = match desc.bias_desc() {
            Some(bias_md) => Some(base.check_input(
                "bias",
                ctx.require(ArgRole::Bias)?,
                bias_md.dtype(),
                desc.oc(),
            )?),
            None => None,
        };
        let mut dst = ctx.take_output(ArgRole::Dst)?;
        check_arg(
            "dst",
            dst.dtype(),
            dst.len(),
            desc.dst_desc().dtype(),
            base.dst_layout().padded_len(),
        )?;
        let (Some(src), Some(weights)) = (src.as_bf16(), weights.as_bf16()) else {
            return Err(ConvError::invalid("src and weights must be bf16"));
        };

        let padded_bias = self.pd.conf.padded_bias_channels();
        base.with_scratchpad(ctx.take_scratchpad(), self.scratchpad.as_ref(), |grant| {
            let bias = match (bias, padded_bias) {
                (Some(raw), Some(_)) => Some(stage_bias(raw, desc.oc(), grant)?),
                (bias, _) => bias,
            };
            let args = ForwardArgs {
                src,
                weights,
                bias,
                dst: dst.reborrow(),
            };
            self.kernel.run(args, grant)
        })?;

        let dst_layout = base.dst_layout();
        if dst_layout.has_padded_channels() {
            match &mut dst {
                TensorViewMut::F32(data) => zero_pad_channels(&mut data[..], dst_layout),
                TensorViewMut::Bf16(data) => zero_pad_channels(&mut data[..], dst_layout),
            }
        }

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
