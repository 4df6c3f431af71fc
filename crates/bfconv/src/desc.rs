//! Convolution descriptors: what the caller asks for, before any implementation looks at it.

use std::fmt;

use smallvec::SmallVec;

use crate::dtype::DataType;
use crate::error::{ConvError, ConvResult};
use crate::layout::{FormatTag, SpatialRank, BLOCK};

pub type Dims = SmallVec<[usize; 6]>;
type SpatialVec = SmallVec<[usize; 3]>;

fn overflow(what: &str) -> ConvError {
    ConvError::invalid(format!("{what} does not fit in usize"))
}

/// Element count of `dims` once the axes in `channel_axes` are padded to whole blocks.
fn padded_elements(dims: &[usize], channel_axes: &[usize]) -> Option<usize> {
    dims.iter().enumerate().try_fold(1usize, |acc, (axis, &dim)| {
        let dim = if channel_axes.contains(&axis) {
            dim.checked_next_multiple_of(BLOCK)?
        } else {
            dim
        };
        acc.checked_mul(dim)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropKind {
    ForwardTraining,
    ForwardInference,
    BackwardData,
    BackwardWeights,
    BackwardBias,
}

impl PropKind {
    pub fn is_forward(self) -> bool {
        matches!(self, PropKind::ForwardTraining | PropKind::ForwardInference)
    }

    pub fn is_backward_data(self) -> bool {
        self == PropKind::BackwardData
    }

    pub fn name(self) -> &'static str {
        match self {
            PropKind::ForwardTraining => "forward_training",
            PropKind::ForwardInference => "forward_inference",
            PropKind::BackwardData => "backward_data",
            PropKind::BackwardWeights => "backward_weights",
            PropKind::BackwardBias => "backward_bias",
        }
    }
}

impl fmt::Display for PropKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgKind {
    Direct,
    Winograd,
    /// Let the implementation pick; resolves to `Direct` here.
    Auto,
}

/// Shape, dtype and (optionally) layout of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dtype: DataType,
    dims: Dims,
    format: FormatTag,
}

impl MemoryDesc {
    pub fn new(dtype: DataType, dims: &[usize]) -> Self {
        Self {
            dtype,
            dims: Dims::from_slice(dims),
            format: FormatTag::Any,
        }
    }

    pub fn with_format(mut self, format: FormatTag) -> Self {
        self.format = format;
        self
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    pub fn has_zero_dim(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }
}

/// Immutable description of one convolution problem.
///
/// For backward-data, `src` holds diff-src and `dst` holds diff-dst; the accessors with the
/// `diff_` prefix name them explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvDesc {
    prop_kind: PropKind,
    alg_kind: AlgKind,
    src: MemoryDesc,
    weights: MemoryDesc,
    bias: Option<MemoryDesc>,
    dst: MemoryDesc,
    strides: SpatialVec,
    padding_l: SpatialVec,
    padding_r: SpatialVec,
    dilation: SpatialVec,
    with_groups: bool,
}

impl ConvDesc {
    pub fn builder(prop_kind: PropKind, alg_kind: AlgKind) -> ConvDescBuilder {
        ConvDescBuilder::new(prop_kind, alg_kind)
    }

    pub fn prop_kind(&self) -> PropKind {
        self.prop_kind
    }

    pub fn alg_kind(&self) -> AlgKind {
        self.alg_kind
    }

    pub fn src_desc(&self) -> &MemoryDesc {
        &self.src
    }

    pub fn diff_src_desc(&self) -> &MemoryDesc {
        &self.src
    }

    pub fn weights_desc(&self) -> &MemoryDesc {
        &self.weights
    }

    pub fn bias_desc(&self) -> Option<&MemoryDesc> {
        self.bias.as_ref()
    }

    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.dst
    }

    pub fn diff_dst_desc(&self) -> &MemoryDesc {
        &self.dst
    }

    pub fn with_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn with_groups(&self) -> bool {
        self.with_groups
    }

    pub fn ndims(&self) -> usize {
        self.src.ndims()
    }

    pub fn spatial_rank(&self) -> SpatialRank {
        // The builder only accepts ranks 3..=5.
        SpatialRank::from_ndims(self.ndims()).unwrap_or(SpatialRank::D1)
    }

    pub fn groups(&self) -> usize {
        if self.with_groups {
            self.weights.dims[0]
        } else {
            1
        }
    }

    pub fn mb(&self) -> usize {
        self.src.dims[0]
    }

    /// Total input channels (all groups).
    pub fn ic(&self) -> usize {
        self.src.dims[1]
    }

    /// Total output channels (all groups).
    pub fn oc(&self) -> usize {
        self.dst.dims[1]
    }

    pub fn src_spatial(&self) -> &[usize] {
        &self.src.dims[2..]
    }

    pub fn dst_spatial(&self) -> &[usize] {
        &self.dst.dims[2..]
    }

    pub fn kernel_spatial(&self) -> &[usize] {
        let skip = if self.with_groups { 3 } else { 2 };
        &self.weights.dims[skip..]
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn padding_l(&self) -> &[usize] {
        &self.padding_l
    }

    pub fn padding_r(&self) -> &[usize] {
        &self.padding_r
    }

    /// Distance between kernel taps; 1 is a dense kernel.
    pub fn dilation(&self) -> &[usize] {
        &self.dilation
    }

    pub fn has_zero_dim(&self) -> bool {
        self.src.has_zero_dim()
            || self.weights.has_zero_dim()
            || self.dst.has_zero_dim()
            || self.bias.as_ref().is_some_and(MemoryDesc::has_zero_dim)
    }

    /// Compact benchdnn-style problem string, e.g. `mb2ic20oc32_iw10ow8kw3sw1dw1pw0`.
    pub fn problem_string(&self) -> String {
        use fmt::Write;

        let mut out = String::new();
        let _ = write!(out, "mb{}", self.mb());
        if self.with_groups {
            let _ = write!(out, "g{}", self.groups());
        }
        let _ = write!(out, "ic{}oc{}", self.ic(), self.oc());
        let names = match self.spatial_rank() {
            SpatialRank::D1 => &["w"][..],
            SpatialRank::D2 => &["h", "w"][..],
            SpatialRank::D3 => &["d", "h", "w"][..],
        };
        for (axis, name) in names.iter().enumerate() {
            let _ = write!(
                out,
                "_i{name}{}o{name}{}k{name}{}s{name}{}d{name}{}p{name}{}",
                self.src_spatial()[axis],
                self.dst_spatial()[axis],
                self.kernel_spatial()[axis],
                self.strides[axis],
                self.dilation[axis],
                self.padding_l[axis],
            );
        }
        out
    }
}

/// Checked construction of a [`ConvDesc`]; `build` returns `InvalidArguments` for
/// descriptors that are malformed regardless of which implementation looks at them.
#[derive(Debug, Clone)]
pub struct ConvDescBuilder {
    prop_kind: PropKind,
    alg_kind: AlgKind,
    src: Option<MemoryDesc>,
    weights: Option<MemoryDesc>,
    bias: Option<MemoryDesc>,
    dst: Option<MemoryDesc>,
    strides: Option<SpatialVec>,
    padding_l: Option<SpatialVec>,
    padding_r: Option<SpatialVec>,
    dilation: Option<SpatialVec>,
}

impl ConvDescBuilder {
    pub fn new(prop_kind: PropKind, alg_kind: AlgKind) -> Self {
        Self {
            prop_kind,
            alg_kind,
            src: None,
            weights: None,
            bias: None,
            dst: None,
            strides: None,
            padding_l: None,
            padding_r: None,
            dilation: None,
        }
    }

    pub fn src(mut self, desc: MemoryDesc) -> Self {
        self.src = Some(desc);
        self
    }

    pub fn diff_src(self, desc: MemoryDesc) -> Self {
        self.src(desc)
    }

    pub fn weights(mut self, desc: MemoryDesc) -> Self {
        self.weights = Some(desc);
        self
    }

    pub fn bias(mut self, desc: MemoryDesc) -> Self {
        self.bias = Some(desc);
        self
    }

    pub fn dst(mut self, desc: MemoryDesc) -> Self {
        self.dst = Some(desc);
        self
    }

    pub fn diff_dst(self, desc: MemoryDesc) -> Self {
        self.dst(desc)
    }

    pub fn strides(mut self, strides: &[usize]) -> Self {
        self.strides = Some(SpatialVec::from_slice(strides));
        self
    }

    /// Symmetric padding.
    pub fn padding(self, padding: &[usize]) -> Self {
        self.padding_lr(padding, padding)
    }

    pub fn padding_lr(mut self, left: &[usize], right: &[usize]) -> Self {
        self.padding_l = Some(SpatialVec::from_slice(left));
        self.padding_r = Some(SpatialVec::from_slice(right));
        self
    }

    pub fn dilation(mut self, dilation: &[usize]) -> Self {
        self.dilation = Some(SpatialVec::from_slice(dilation));
        self
    }

    pub fn build(self) -> ConvResult<ConvDesc> {
        let src = self.src.ok_or_else(|| ConvError::invalid("source descriptor missing"))?;
        let weights = self
            .weights
            .ok_or_else(|| ConvError::invalid("weights descriptor missing"))?;
        let dst = self
            .dst
            .ok_or_else(|| ConvError::invalid("destination descriptor missing"))?;

        let ndims = src.ndims();
        let rank = SpatialRank::from_ndims(ndims)
            .ok_or_else(|| ConvError::invalid(format!("source rank {ndims} is not 3, 4 or 5")))?;
        let nsp = rank.count();
        if dst.ndims() != ndims {
            return Err(ConvError::invalid(format!(
                "destination rank {} does not match source rank {ndims}",
                dst.ndims()
            )));
        }
        let with_groups = match weights.ndims() {
            n if n == ndims => false,
            n if n == ndims + 1 => true,
            n => {
                return Err(ConvError::invalid(format!(
                    "weights rank {n} is incompatible with source rank {ndims}"
                )))
            }
        };

        let spatial_param = |value: Option<SpatialVec>, fill: usize, what: &str| {
            let value = value.unwrap_or_else(|| SpatialVec::from_elem(fill, nsp));
            if value.len() != nsp {
                return Err(ConvError::invalid(format!(
                    "{what} has {} entries, expected {nsp}",
                    value.len()
                )));
            }
            Ok(value)
        };
        let strides = spatial_param(self.strides, 1, "strides")?;
        let padding_l = spatial_param(self.padding_l, 0, "left padding")?;
        let padding_r = spatial_param(self.padding_r, 0, "right padding")?;
        let dilation = spatial_param(self.dilation, 1, "dilation")?;
        if strides.iter().any(|&s| s == 0) {
            return Err(ConvError::invalid("strides must be positive"));
        }
        if dilation.iter().any(|&d| d == 0) {
            return Err(ConvError::invalid("dilation must be positive"));
        }

        let (groups, wdims) = if with_groups {
            (weights.dims[0], &weights.dims[1..])
        } else {
            (1, &weights.dims[..])
        };
        let (oc_per_group, ic_per_group) = (wdims[0], wdims[1]);
        if src.dims[0] != dst.dims[0] {
            return Err(ConvError::invalid("source and destination minibatch differ"));
        }
        let ic = groups
            .checked_mul(ic_per_group)
            .ok_or_else(|| overflow("input channel count"))?;
        let oc = groups
            .checked_mul(oc_per_group)
            .ok_or_else(|| overflow("output channel count"))?;
        if src.dims[1] != ic {
            return Err(ConvError::invalid(format!(
                "source channels {} do not match {groups} groups x {ic_per_group} weights input channels",
                src.dims[1]
            )));
        }
        if dst.dims[1] != oc {
            return Err(ConvError::invalid(format!(
                "destination channels {} do not match {groups} groups x {oc_per_group} weights output channels",
                dst.dims[1]
            )));
        }
        if let Some(bias) = &self.bias {
            if bias.dims() != [oc] {
                return Err(ConvError::invalid(format!(
                    "bias dims {:?} do not match [{oc}]",
                    bias.dims()
                )));
            }
        }

        for axis in 0..nsp {
            let input = src.dims[2 + axis];
            let output = dst.dims[2 + axis];
            let kernel = wdims[2 + axis];
            if input == 0 || output == 0 || kernel == 0 {
                continue;
            }
            let extent = (kernel - 1)
                .checked_mul(dilation[axis])
                .and_then(|span| span.checked_add(1))
                .ok_or_else(|| overflow("kernel extent"))?;
            let padded = input
                .checked_add(padding_l[axis])
                .and_then(|sum| sum.checked_add(padding_r[axis]))
                .ok_or_else(|| overflow("padded input extent"))?;
            if padded < extent {
                return Err(ConvError::invalid(format!(
                    "kernel extent {extent} exceeds padded input {padded} on spatial axis {axis}"
                )));
            }
            let expected = (padded - extent) / strides[axis] + 1;
            if output != expected {
                return Err(ConvError::invalid(format!(
                    "destination extent {output} on spatial axis {axis} should be {expected}"
                )));
            }
        }

        let weights_channels: &[usize] = if with_groups { &[1, 2] } else { &[0, 1] };
        let sizes = [
            ("source", padded_elements(&src.dims, &[1])),
            ("weights", padded_elements(&weights.dims, weights_channels)),
            ("destination", padded_elements(&dst.dims, &[1])),
        ];
        for (what, elements) in sizes {
            if elements.is_none() {
                return Err(overflow(&format!("{what} element count")));
            }
        }

        Ok(ConvDesc {
            prop_kind: self.prop_kind,
            alg_kind: self.alg_kind,
            src,
            weights,
            bias: self.bias,
            dst,
            strides,
            padding_l,
            padding_r,
            dilation,
            with_groups,
        })
    }
}
