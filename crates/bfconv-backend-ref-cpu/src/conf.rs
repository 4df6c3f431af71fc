//! Configuration derived once per primitive: problem geometry, threading and which scratchpad
//! regions the kernel uses.

use bfconv::layout::{spatial_3d, BLOCK};
use bfconv::{
    select_formats, ActivationLayout, ConvDesc, ConvLayouts, DataType, Direction, KernelConfig,
    PostOp, PrimitiveAttr, WeightsInterleave, WeightsLayout,
};

/// Geometry and work split of one reference convolution. Spatial arrays are `[d, h, w]`;
/// missing dimensions are 1 (kernel, stride, dilation) or 0 (padding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefConvConf {
    pub direction: Direction,
    pub mb: usize,
    pub ngroups: usize,
    /// Input channels per group.
    pub ic: usize,
    /// Output channels per group.
    pub oc: usize,
    pub nb_ic: usize,
    pub nb_oc: usize,
    pub src: ActivationLayout,
    pub dst: ActivationLayout,
    pub weights: WeightsLayout,
    pub stride: [usize; 3],
    pub dilate: [usize; 3],
    pub pad_l: [usize; 3],
    pub pad_r: [usize; 3],
    pub with_bias: bool,
    pub bias_dt: DataType,
    /// `(n, group, channel block)` slices of the output.
    pub work_amount: usize,
    /// Reduction split factor; 1 means every unit is reduced by a single thread.
    pub nthr_ic: usize,
    pub nthr: usize,
    /// Source is staged into a zero-padded f32 copy before the reduction.
    pub with_src_transpose: bool,
}

fn spatial_param(values: &[usize], fill: usize) -> [usize; 3] {
    match *values {
        [w] => [fill, fill, w],
        [h, w] => [fill, h, w],
        [d, h, w] => [d, h, w],
        _ => [fill; 3],
    }
}

/// Forward post-op chains the epilogue implements.
pub fn post_ops_supported(attr: &PrimitiveAttr) -> bool {
    matches!(
        attr.post_ops().ops(),
        []
            | [PostOp::Eltwise { .. }]
            | [PostOp::Sum { .. }]
            | [PostOp::Sum { .. }, PostOp::Eltwise { .. }]
    )
}

impl RefConvConf {
    pub fn init(
        desc: &ConvDesc,
        layouts: &ConvLayouts,
        attr: &PrimitiveAttr,
        nthreads: usize,
        direction: Direction,
    ) -> Option<Self> {
        let expected = select_formats(desc.spatial_rank(), desc.with_groups(), direction);
        if layouts.src != expected.data
            || layouts.dst != expected.data
            || layouts.weights != expected.weights
        {
            return None;
        }
        let attr_ok = match direction {
            Direction::Forward => post_ops_supported(attr),
            Direction::BackwardData => attr.has_default_values(),
        };
        if !attr_ok {
            return None;
        }

        let ngroups = desc.groups();
        let ic = desc.ic() / ngroups;
        let oc = desc.oc() / ngroups;
        if ngroups > 1 && (ic % BLOCK != 0 || oc % BLOCK != 0) {
            return None;
        }

        let kernel = spatial_3d(desc.kernel_spatial());
        let stride = spatial_param(desc.strides(), 1);
        let dilate = spatial_param(desc.dilation(), 1);
        let pad_l = spatial_param(desc.padding_l(), 0);
        let pad_r = spatial_param(desc.padding_r(), 0);
        for axis in 0..3 {
            let extent = kernel[axis].saturating_sub(1) * dilate[axis] + 1;
            if pad_l[axis] >= extent || pad_r[axis] >= extent {
                return None;
            }
        }

        let interleave = match direction {
            Direction::Forward => WeightsInterleave::InputPairs,
            Direction::BackwardData => WeightsInterleave::OutputPairs,
        };
        let weights = WeightsLayout::new(desc.weights_desc().dims(), desc.with_groups(), interleave);
        let nb_ic = ic.div_ceil(BLOCK);
        let nb_oc = oc.div_ceil(BLOCK);
        let mb = desc.mb();

        // Forward owns output channel blocks, backward-data owns input channel blocks.
        let (work_amount, nb_reduce) = match direction {
            Direction::Forward => (mb * ngroups * nb_oc, nb_ic),
            Direction::BackwardData => (mb * ngroups * nb_ic, nb_oc),
        };
        let nthreads = nthreads.max(1);
        let nthr_ic = if direction == Direction::Forward
            && work_amount < nthreads
            && nb_reduce > 1
        {
            nb_reduce.min(nthreads / work_amount).max(1)
        } else {
            1
        };
        let nthr = nthreads.min(work_amount * nthr_ic).max(1);
        let with_src_transpose = direction == Direction::Forward
            && pad_l.iter().chain(pad_r.iter()).any(|&p| p > 0);

        Some(Self {
            direction,
            mb,
            ngroups,
            ic,
            oc,
            nb_ic,
            nb_oc,
            src: ActivationLayout::new(desc.src_desc().dims()),
            dst: ActivationLayout::new(desc.dst_desc().dims()),
            weights,
            stride,
            dilate,
            pad_l,
            pad_r,
            with_bias: desc.with_bias(),
            bias_dt: desc.bias_desc().map_or(DataType::Undef, |bias| bias.dtype()),
            work_amount,
            nthr_ic,
            nthr,
            with_src_transpose,
        })
    }

    pub fn kernel(&self) -> [usize; 3] {
        self.weights.kernel
    }

    /// Zero-padded source extents `[d, h, w]`.
    pub fn padded_src_spatial(&self) -> [usize; 3] {
        let mut padded = self.src.spatial;
        for (axis, extent) in padded.iter_mut().enumerate() {
            *extent += self.pad_l[axis] + self.pad_r[axis];
        }
        padded
    }

    /// f32 elements of one staged source image (every input channel block of one group).
    pub fn src_transpose_len(&self) -> usize {
        if !self.with_src_transpose {
            return 0;
        }
        self.nb_ic * self.padded_src_spatial().iter().product::<usize>() * BLOCK
    }

    /// f32 elements of one partial-sum chunk (one unit of output).
    pub fn reduction_len(&self) -> usize {
        if self.nthr_ic <= 1 {
            return 0;
        }
        self.dst.block_len()
    }

    /// Output channels across all groups, rounded up to whole blocks.
    pub fn padded_oc_total(&self) -> usize {
        self.dst.padded_channels()
    }
}

impl KernelConfig for RefConvConf {
    fn nthreads(&self) -> usize {
        self.nthr
    }

    fn padded_bias_channels(&self) -> Option<usize> {
        let oc_total = self.ngroups * self.oc;
        (self.with_bias && oc_total % BLOCK != 0).then(|| self.padded_oc_total())
    }

    fn src_transpose_bytes(&self) -> usize {
        self.src_transpose_len() * std::mem::size_of::<f32>()
    }

    fn reduction_bytes(&self) -> usize {
        self.reduction_len() * std::mem::size_of::<f32>()
    }
}
