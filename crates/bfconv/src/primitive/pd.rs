//! Primitive descriptors: validation, layout resolution and scratchpad planning shared by both
//! convolution directions.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::attr::{PrimitiveAttr, ScratchpadMode};
use crate::cpu::{CpuEngine, CpuIsa};
use crate::desc::{AlgKind, ConvDesc, MemoryDesc};
use crate::dtype::DataType;
use crate::error::{ConvError, ConvResult};
use crate::exec::TensorView;
use crate::kernel::KernelConfig;
use crate::layout::{
    select_formats, ActivationLayout, ConvLayouts, Direction, FormatTag, SpatialRank,
    WeightsInterleave, WeightsLayout,
};
use crate::scratchpad::{
    Scratchpad, ScratchpadGrant, ScratchpadKey, ScratchpadRegistry, SCRATCHPAD_ALIGN,
};

use super::PrimitiveKind;

/// ISA the blocked bf16 kernels are written for.
pub const REQUIRED_ISA: CpuIsa = CpuIsa::Avx512Core;

/// Layout decision of a validated forward descriptor, offered to backward-data creation.
///
/// Only the data layout carries over; backward-data weights always use the output-pair
/// interleave. A hint for another rank or grouping is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FwdHint {
    pub rank: SpatialRank,
    pub with_groups: bool,
    pub data: FormatTag,
}

/// Logs the single rejection event and returns the opaque outcome.
pub(crate) fn unsupported(kind: PrimitiveKind, impl_name: &str) -> ConvError {
    trace!(kind = kind.name(), impl_name, "not supported");
    ConvError::Unsupported
}

fn resolve(requested: FormatTag, expected: FormatTag) -> Option<FormatTag> {
    if requested.is_any() || requested == expected {
        Some(expected)
    } else {
        None
    }
}

fn dtype_in(md: &MemoryDesc, allowed: &[DataType]) -> bool {
    allowed.contains(&md.dtype())
}

fn forward_types_ok(desc: &ConvDesc) -> bool {
    dtype_in(desc.src_desc(), &[DataType::Bf16])
        && dtype_in(desc.weights_desc(), &[DataType::Bf16])
        && dtype_in(desc.dst_desc(), &[DataType::Bf16, DataType::F32])
        && desc
            .bias_desc()
            .map_or(true, |bias| dtype_in(bias, &[DataType::F32, DataType::Bf16]))
}

fn backward_data_types_ok(desc: &ConvDesc) -> bool {
    dtype_in(desc.diff_src_desc(), &[DataType::F32, DataType::Bf16])
        && dtype_in(desc.weights_desc(), &[DataType::Bf16])
        && dtype_in(desc.diff_dst_desc(), &[DataType::Bf16])
        && desc.bias_desc().is_none()
}

/// Runs every creation-time check in order and resolves the layouts. `None` on the first
/// failing check.
pub(crate) fn validate(
    engine: &CpuEngine,
    desc: &ConvDesc,
    direction: Direction,
    hint: Option<&FwdHint>,
) -> Option<ConvLayouts> {
    if !engine.mayiuse(REQUIRED_ISA) {
        return None;
    }
    let prop_ok = match direction {
        Direction::Forward => desc.prop_kind().is_forward(),
        Direction::BackwardData => desc.prop_kind().is_backward_data(),
    };
    if !prop_ok {
        return None;
    }
    if !matches!(desc.alg_kind(), AlgKind::Direct | AlgKind::Auto) {
        return None;
    }
    let types_ok = match direction {
        Direction::Forward => forward_types_ok(desc),
        Direction::BackwardData => backward_data_types_ok(desc),
    };
    if !types_ok || desc.has_zero_dim() {
        return None;
    }

    let rank = desc.spatial_rank();
    let with_groups = desc.with_groups();
    let mut formats = select_formats(rank, with_groups, direction);
    if direction == Direction::BackwardData {
        let hint = hint.filter(|hint| hint.rank == rank && hint.with_groups == with_groups);
        if let Some(hint) = hint {
            formats.data = hint.data;
        }
    }
    Some(ConvLayouts {
        src: resolve(desc.src_desc().format(), formats.data)?,
        weights: resolve(desc.weights_desc().format(), formats.weights)?,
        bias: match desc.bias_desc() {
            Some(bias) => Some(resolve(bias.format(), FormatTag::X)?),
            None => None,
        },
        dst: resolve(desc.dst_desc().format(), formats.data)?,
    })
}

fn region_bytes(count: usize, unit: usize) -> ConvResult<usize> {
    count
        .checked_mul(unit)
        .ok_or(ConvError::OutOfMemory { bytes: usize::MAX })
}

/// Books every scratchpad region the configuration asks for. A total that does not fit in
/// the address space is [`ConvError::OutOfMemory`].
pub(crate) fn plan_scratchpad(
    conf: &dyn KernelConfig,
    bias_dtype: Option<DataType>,
) -> ConvResult<ScratchpadRegistry> {
    let mut registry = ScratchpadRegistry::new();
    let mut registrar = registry.registrar();
    if let (Some(channels), Some(dtype)) = (conf.padded_bias_channels(), bias_dtype) {
        registrar.book(
            ScratchpadKey::ConvPaddedBias,
            region_bytes(channels, dtype.size_in_bytes())?,
            SCRATCHPAD_ALIGN,
        )?;
    }
    let nthreads = conf.nthreads();
    registrar.book(
        ScratchpadKey::ConvTrSrc,
        region_bytes(nthreads, conf.src_transpose_bytes())?,
        SCRATCHPAD_ALIGN,
    )?;
    registrar.book(
        ScratchpadKey::ConvPartialSums,
        region_bytes(nthreads, conf.reduction_bytes())?,
        SCRATCHPAD_ALIGN,
    )?;
    Ok(registry)
}

/// Validated state common to forward and backward-data descriptors.
#[derive(Debug, Clone)]
pub struct ConvPdBase {
    desc: ConvDesc,
    attr: PrimitiveAttr,
    layouts: ConvLayouts,
    src_layout: ActivationLayout,
    dst_layout: ActivationLayout,
    weights_layout: WeightsLayout,
    registry: Arc<ScratchpadRegistry>,
}

impl ConvPdBase {
    pub(crate) fn new(
        desc: &ConvDesc,
        attr: &PrimitiveAttr,
        layouts: ConvLayouts,
        interleave: WeightsInterleave,
        registry: ScratchpadRegistry,
    ) -> Self {
        Self {
            desc: desc.clone(),
            attr: attr.clone(),
            layouts,
            src_layout: ActivationLayout::new(desc.src_desc().dims()),
            dst_layout: ActivationLayout::new(desc.dst_desc().dims()),
            weights_layout: WeightsLayout::new(
                desc.weights_desc().dims(),
                desc.with_groups(),
                interleave,
            ),
            registry: Arc::new(registry),
        }
    }

    /// Descriptor as given at creation.
    pub fn desc(&self) -> &ConvDesc {
        &self.desc
    }

    pub fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    /// Concrete tags every `any` request resolved to.
    pub fn layouts(&self) -> &ConvLayouts {
        &self.layouts
    }

    /// Source (diff-source for backward-data) geometry.
    pub fn src_layout(&self) -> &ActivationLayout {
        &self.src_layout
    }

    /// Destination (diff-destination for backward-data) geometry.
    pub fn dst_layout(&self) -> &ActivationLayout {
        &self.dst_layout
    }

    /// Blocked and padded weights geometry.
    pub fn weights_layout(&self) -> &WeightsLayout {
        &self.weights_layout
    }

    /// Frozen bookings; a user scratchpad must be created from this same registry.
    pub fn scratchpad_registry(&self) -> &Arc<ScratchpadRegistry> {
        &self.registry
    }

    /// Bytes a user scratchpad needs; zero when nothing was booked.
    pub fn scratchpad_size(&self) -> usize {
        self.registry.size()
    }

    pub fn hint(&self) -> FwdHint {
        FwdHint {
            rank: self.desc.spatial_rank(),
            with_groups: self.desc.with_groups(),
            data: self.layouts.src,
        }
    }

    /// Allocates the scratchpad a library-mode primitive keeps for its whole lifetime.
    /// `None` in user mode or when nothing was booked.
    pub(crate) fn library_scratchpad(&self) -> ConvResult<Option<Mutex<Scratchpad>>> {
        if self.registry.is_empty() || self.attr.scratchpad_mode() != ScratchpadMode::Library {
            return Ok(None);
        }
        let pad = Scratchpad::new(Arc::clone(&self.registry))?;
        Ok(Some(Mutex::new(pad)))
    }

    /// Checks a per-call input against its expected dtype and padded length.
    pub(crate) fn check_input<'a>(
        &self,
        what: &str,
        view: TensorView<'a>,
        dtype: DataType,
        required: usize,
    ) -> ConvResult<TensorView<'a>> {
        check_arg(what, view.dtype(), view.len(), dtype, required)?;
        Ok(view)
    }

    /// Runs `f` with a grant over the caller's scratchpad, or over the one the primitive
    /// owns in library mode. Executions sharing the owned scratchpad run one at a time.
    pub(crate) fn with_scratchpad<R>(
        &self,
        provided: Option<&mut Scratchpad>,
        owned: Option<&Mutex<Scratchpad>>,
        f: impl FnOnce(&mut ScratchpadGrant<'_>) -> ConvResult<R>,
    ) -> ConvResult<R> {
        if let Some(pad) = provided {
            if !Arc::ptr_eq(pad.registry(), &self.registry) {
                return Err(ConvError::invalid(
                    "scratchpad was created for a different primitive",
                ));
            }
            return f(&mut pad.grant());
        }
        if self.registry.is_empty() {
            return f(&mut ScratchpadGrant::empty());
        }
        match owned {
            Some(pad) => {
                // A kernel that panicked left no state the next grant depends on.
                let mut pad = pad.lock().unwrap_or_else(PoisonError::into_inner);
                let result = f(&mut pad.grant());
                result
            }
            None => Err(ConvError::invalid(format!(
                "primitive needs a {} byte user scratchpad",
                self.registry.size()
            ))),
        }
    }
}

pub(crate) fn check_arg(
    what: &str,
    actual_dtype: DataType,
    actual_len: usize,
    dtype: DataType,
    required: usize,
) -> ConvResult<()> {
    if actual_dtype != dtype {
        return Err(ConvError::invalid(format!(
            "{what} is {actual_dtype}, expected {dtype}"
        )));
    }
    if actual_len < required {
        return Err(ConvError::invalid(format!(
            "{what} holds {actual_len} elements, the blocked layout needs {required}"
        )));
    }
    Ok(())
}
