//! Memory layouts used by the blocked bf16 convolution.
//!
//! Activations keep 16 channels contiguous (one 512-bit register of f32 lanes). Weights use an
//! interleaved block of 16x16 channels where pairs of the reduction channel sit next to each
//! other, because the bf16 dot-product instruction consumes two bf16 values per 32-bit lane.
//! Forward reduces over input channels (`8i16o2i`), backward-data over output channels
//! (`8o16i2o`).

use std::fmt;

use crate::error::{ConvError, ConvResult};

/// Channel block width of every blocked layout in this crate.
pub const BLOCK: usize = 16;

/// Elements in one `16x16` weight block.
const WEIGHTS_BLOCK: usize = BLOCK * BLOCK;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(non_camel_case_types)]
pub enum FormatTag {
    /// Let the primitive choose.
    #[default]
    Any,
    X,
    Ncw,
    Nchw,
    Ncdhw,
    Oiw,
    Goiw,
    Oihw,
    Goihw,
    Oidhw,
    Goidhw,
    NCw16c,
    NChw16c,
    NCdhw16c,
    OIw8i16o2i,
    gOIw8i16o2i,
    OIhw8i16o2i,
    gOIhw8i16o2i,
    OIdhw8i16o2i,
    gOIdhw8i16o2i,
    OIw8o16i2o,
    gOIw8o16i2o,
    OIhw8o16i2o,
    gOIhw8o16i2o,
    OIdhw8o16i2o,
    gOIdhw8o16i2o,
}

impl FormatTag {
    pub fn name(self) -> &'static str {
        match self {
            FormatTag::Any => "any",
            FormatTag::X => "x",
            FormatTag::Ncw => "ncw",
            FormatTag::Nchw => "nchw",
            FormatTag::Ncdhw => "ncdhw",
            FormatTag::Oiw => "oiw",
            FormatTag::Goiw => "goiw",
            FormatTag::Oihw => "oihw",
            FormatTag::Goihw => "goihw",
            FormatTag::Oidhw => "oidhw",
            FormatTag::Goidhw => "goidhw",
            FormatTag::NCw16c => "nCw16c",
            FormatTag::NChw16c => "nChw16c",
            FormatTag::NCdhw16c => "nCdhw16c",
            FormatTag::OIw8i16o2i => "OIw8i16o2i",
            FormatTag::gOIw8i16o2i => "gOIw8i16o2i",
            FormatTag::OIhw8i16o2i => "OIhw8i16o2i",
            FormatTag::gOIhw8i16o2i => "gOIhw8i16o2i",
            FormatTag::OIdhw8i16o2i => "OIdhw8i16o2i",
            FormatTag::gOIdhw8i16o2i => "gOIdhw8i16o2i",
            FormatTag::OIw8o16i2o => "OIw8o16i2o",
            FormatTag::gOIw8o16i2o => "gOIw8o16i2o",
            FormatTag::OIhw8o16i2o => "OIhw8o16i2o",
            FormatTag::gOIhw8o16i2o => "gOIhw8o16i2o",
            FormatTag::OIdhw8o16i2o => "OIdhw8o16i2o",
            FormatTag::gOIdhw8o16i2o => "gOIdhw8o16i2o",
        }
    }

    pub fn is_any(self) -> bool {
        self == FormatTag::Any
    }

    /// Interleave of a blocked weights tag, `None` for everything else.
    pub fn weights_interleave(self) -> Option<WeightsInterleave> {
        use FormatTag::*;
        match self {
            OIw8i16o2i | gOIw8i16o2i | OIhw8i16o2i | gOIhw8i16o2i | OIdhw8i16o2i
            | gOIdhw8i16o2i => Some(WeightsInterleave::InputPairs),
            OIw8o16i2o | gOIw8o16i2o | OIhw8o16i2o | gOIhw8o16i2o | OIdhw8o16i2o
            | gOIdhw8o16i2o => Some(WeightsInterleave::OutputPairs),
            _ => None,
        }
    }

    pub fn is_blocked_data(self) -> bool {
        matches!(
            self,
            FormatTag::NCw16c | FormatTag::NChw16c | FormatTag::NCdhw16c
        )
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of spatial dimensions of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialRank {
    D1,
    D2,
    D3,
}

impl SpatialRank {
    /// Maps a tensor rank (batch + channels + spatial) to its spatial rank.
    pub fn from_ndims(ndims: usize) -> Option<Self> {
        match ndims {
            3 => Some(SpatialRank::D1),
            4 => Some(SpatialRank::D2),
            5 => Some(SpatialRank::D3),
            _ => None,
        }
    }

    pub fn count(self) -> usize {
        match self {
            SpatialRank::D1 => 1,
            SpatialRank::D2 => 2,
            SpatialRank::D3 => 3,
        }
    }

    fn index(self) -> usize {
        self.count() - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    BackwardData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightsInterleave {
    /// `8i16o2i`: pairs of input channels, output channels across lanes.
    InputPairs,
    /// `8o16i2o`: pairs of output channels, input channels across lanes.
    OutputPairs,
}

/// Tags picked by [`select_formats`]; `data` applies to both source and destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvFormats {
    pub data: FormatTag,
    pub weights: FormatTag,
}

const DATA_TAGS: [FormatTag; 3] = [FormatTag::NCw16c, FormatTag::NChw16c, FormatTag::NCdhw16c];

const FWD_WEIGHTS_TAGS: [FormatTag; 6] = [
    FormatTag::OIw8i16o2i,
    FormatTag::gOIw8i16o2i,
    FormatTag::OIhw8i16o2i,
    FormatTag::gOIhw8i16o2i,
    FormatTag::OIdhw8i16o2i,
    FormatTag::gOIdhw8i16o2i,
];

const BWD_DATA_WEIGHTS_TAGS: [FormatTag; 6] = [
    FormatTag::OIw8o16i2o,
    FormatTag::gOIw8o16i2o,
    FormatTag::OIhw8o16i2o,
    FormatTag::gOIhw8o16i2o,
    FormatTag::OIdhw8o16i2o,
    FormatTag::gOIdhw8o16i2o,
];

/// Picks the blocked layouts the kernel expects. Pure and total.
pub fn select_formats(rank: SpatialRank, with_groups: bool, direction: Direction) -> ConvFormats {
    let weights_index = 2 * rank.index() + usize::from(with_groups);
    let weights = match direction {
        Direction::Forward => FWD_WEIGHTS_TAGS[weights_index],
        Direction::BackwardData => BWD_DATA_WEIGHTS_TAGS[weights_index],
    };
    ConvFormats {
        data: DATA_TAGS[rank.index()],
        weights,
    }
}

/// Resolved layouts for every tensor of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvLayouts {
    pub src: FormatTag,
    pub weights: FormatTag,
    pub bias: Option<FormatTag>,
    pub dst: FormatTag,
}

fn div_up(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

/// Spatial extents padded to three dimensions as `[d, h, w]`.
pub fn spatial_3d(spatial: &[usize]) -> [usize; 3] {
    match *spatial {
        [w] => [1, 1, w],
        [h, w] => [1, h, w],
        [d, h, w] => [d, h, w],
        _ => [1, 1, 1],
    }
}

/// Geometry of an activation tensor stored as `nC[d][h]w16c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationLayout {
    pub mb: usize,
    pub channels: usize,
    /// `[d, h, w]`, missing dimensions are 1.
    pub spatial: [usize; 3],
}

impl ActivationLayout {
    /// `dims` is `[N, C, spatial...]`.
    pub fn new(dims: &[usize]) -> Self {
        let (mb, channels) = match dims {
            [n, c, ..] => (*n, *c),
            [n] => (*n, 0),
            [] => (0, 0),
        };
        Self {
            mb,
            channels,
            spatial: spatial_3d(dims.get(2..).unwrap_or(&[])),
        }
    }

    pub fn channel_blocks(&self) -> usize {
        div_up(self.channels, BLOCK)
    }

    pub fn padded_channels(&self) -> usize {
        self.channel_blocks() * BLOCK
    }

    pub fn spatial_size(&self) -> usize {
        self.spatial.iter().product()
    }

    /// Elements in one `(n, channel block)` chunk.
    pub fn block_len(&self) -> usize {
        self.spatial_size() * BLOCK
    }

    pub fn logical_len(&self) -> usize {
        self.mb * self.channels * self.spatial_size()
    }

    /// Buffer length including the padded channel lanes.
    pub fn padded_len(&self) -> usize {
        self.mb * self.channel_blocks() * self.block_len()
    }

    pub fn has_padded_channels(&self) -> bool {
        self.channels % BLOCK != 0
    }

    #[inline]
    pub fn spatial_index(&self, d: usize, h: usize, w: usize) -> usize {
        (d * self.spatial[1] + h) * self.spatial[2] + w
    }

    #[inline]
    pub fn offset(&self, n: usize, c: usize, d: usize, h: usize, w: usize) -> usize {
        let block = n * self.channel_blocks() + c / BLOCK;
        (block * self.spatial_size() + self.spatial_index(d, h, w)) * BLOCK + c % BLOCK
    }
}

/// Geometry of a weights tensor stored in one of the interleaved blocked layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightsLayout {
    pub groups: usize,
    /// Output channels per group.
    pub oc: usize,
    /// Input channels per group.
    pub ic: usize,
    /// `[kd, kh, kw]`, missing dimensions are 1.
    pub kernel: [usize; 3],
    pub interleave: WeightsInterleave,
}

impl WeightsLayout {
    /// `dims` is `[G, OC/G, IC/G, k...]` when `with_groups`, `[OC, IC, k...]` otherwise.
    pub fn new(dims: &[usize], with_groups: bool, interleave: WeightsInterleave) -> Self {
        let (groups, rest) = if with_groups {
            (dims.first().copied().unwrap_or(1), dims.get(1..).unwrap_or(&[]))
        } else {
            (1, dims)
        };
        let (oc, ic) = match rest {
            [o, i, ..] => (*o, *i),
            _ => (0, 0),
        };
        Self {
            groups,
            oc,
            ic,
            kernel: spatial_3d(rest.get(2..).unwrap_or(&[])),
            interleave,
        }
    }

    /// Output-channel blocks per group.
    pub fn oc_blocks(&self) -> usize {
        div_up(self.oc, BLOCK)
    }

    /// Input-channel blocks per group.
    pub fn ic_blocks(&self) -> usize {
        div_up(self.ic, BLOCK)
    }

    /// Spatial taps per filter.
    pub fn kernel_size(&self) -> usize {
        self.kernel.iter().product()
    }

    pub fn logical_len(&self) -> usize {
        self.groups * self.oc * self.ic * self.kernel_size()
    }

    pub fn padded_len(&self) -> usize {
        self.groups * self.oc_blocks() * self.ic_blocks() * self.kernel_size() * WEIGHTS_BLOCK
    }

    #[inline]
    pub fn kernel_index(&self, kd: usize, kh: usize, kw: usize) -> usize {
        (kd * self.kernel[1] + kh) * self.kernel[2] + kw
    }

    /// Offset of the first element of the `16x16` block `(g, ocb, icb, k)`.
    #[inline]
    pub fn block_offset(&self, g: usize, ocb: usize, icb: usize, k: usize) -> usize {
        (((g * self.oc_blocks() + ocb) * self.ic_blocks() + icb) * self.kernel_size() + k)
            * WEIGHTS_BLOCK
    }

    /// Position of `(oc % 16, ic % 16)` inside a block.
    #[inline]
    pub fn inner_offset(&self, ocl: usize, icl: usize) -> usize {
        match self.interleave {
            WeightsInterleave::InputPairs => (icl / 2) * 2 * BLOCK + ocl * 2 + icl % 2,
            WeightsInterleave::OutputPairs => (ocl / 2) * 2 * BLOCK + icl * 2 + ocl % 2,
        }
    }

    #[inline]
    pub fn offset(&self, g: usize, oc: usize, ic: usize, k: usize) -> usize {
        self.block_offset(g, oc / BLOCK, ic / BLOCK, k) + self.inner_offset(oc % BLOCK, ic % BLOCK)
    }
}

fn check_len(what: &str, actual: usize, required: usize) -> ConvResult<()> {
    if actual < required {
        return Err(ConvError::invalid(format!(
            "{what} buffer holds {actual} elements, {required} required"
        )));
    }
    Ok(())
}

/// Converts a plain `ncdhw` (or `ncw` / `nchw`) tensor into its blocked layout.
/// Padded lanes are filled with `T::default()`.
pub fn reorder_activation_to_blocked<T: Copy + Default>(
    plain: &[T],
    layout: &ActivationLayout,
) -> ConvResult<Vec<T>> {
    check_len("plain activation", plain.len(), layout.logical_len())?;
    let mut blocked = vec![T::default(); layout.padded_len()];
    let sp = layout.spatial_size();
    let [depth, height, width] = layout.spatial;
    for n in 0..layout.mb {
        for c in 0..layout.channels {
            let base = (n * layout.channels + c) * sp;
            for d in 0..depth {
                for h in 0..height {
                    for w in 0..width {
                        let s = layout.spatial_index(d, h, w);
                        blocked[layout.offset(n, c, d, h, w)] = plain[base + s];
                    }
                }
            }
        }
    }
    Ok(blocked)
}

/// Inverse of [`reorder_activation_to_blocked`]; padded lanes are dropped.
pub fn reorder_activation_from_blocked<T: Copy + Default>(
    blocked: &[T],
    layout: &ActivationLayout,
) -> ConvResult<Vec<T>> {
    check_len("blocked activation", blocked.len(), layout.padded_len())?;
    let mut plain = vec![T::default(); layout.logical_len()];
    let sp = layout.spatial_size();
    let [depth, height, width] = layout.spatial;
    for n in 0..layout.mb {
        for c in 0..layout.channels {
            let base = (n * layout.channels + c) * sp;
            for d in 0..depth {
                for h in 0..height {
                    for w in 0..width {
                        let s = layout.spatial_index(d, h, w);
                        plain[base + s] = blocked[layout.offset(n, c, d, h, w)];
                    }
                }
            }
        }
    }
    Ok(plain)
}

/// Converts plain `[g]oi[d][h]w` weights into the blocked interleaved layout.
pub fn reorder_weights_to_blocked<T: Copy + Default>(
    plain: &[T],
    layout: &WeightsLayout,
) -> ConvResult<Vec<T>> {
    check_len("plain weights", plain.len(), layout.logical_len())?;
    let mut blocked = vec![T::default(); layout.padded_len()];
    let ksp = layout.kernel_size();
    for g in 0..layout.groups {
        for oc in 0..layout.oc {
            for ic in 0..layout.ic {
                let base = ((g * layout.oc + oc) * layout.ic + ic) * ksp;
                for k in 0..ksp {
                    blocked[layout.offset(g, oc, ic, k)] = plain[base + k];
                }
            }
        }
    }
    Ok(blocked)
}

/// Resets the lanes past the logical channel count of the last channel block, for every batch
/// index and spatial position.
pub fn zero_pad_channels<T: Copy + Default>(data: &mut [T], layout: &ActivationLayout) {
    if !layout.has_padded_channels() || layout.channel_blocks() == 0 {
        return;
    }
    let tail_start = layout.channels % BLOCK;
    let last_block = layout.channel_blocks() - 1;
    let block_len = layout.block_len();
    for n in 0..layout.mb {
        let start = (n * layout.channel_blocks() + last_block) * block_len;
        let Some(chunk) = data.get_mut(start..start + block_len) else {
            return;
        };
        for lanes in chunk.chunks_exact_mut(BLOCK) {
            lanes[tail_start..].fill(T::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_offsets_walk_blocks_then_space() {
        let layout = ActivationLayout::new(&[2, 20, 5]);
        assert_eq!(layout.channel_blocks(), 2);
        assert_eq!(layout.padded_len(), 2 * 2 * 5 * 16);
        assert_eq!(layout.offset(0, 0, 0, 0, 0), 0);
        assert_eq!(layout.offset(0, 1, 0, 0, 0), 1);
        assert_eq!(layout.offset(0, 0, 0, 0, 1), 16);
        assert_eq!(layout.offset(0, 16, 0, 0, 0), 5 * 16);
        assert_eq!(layout.offset(1, 0, 0, 0, 0), 2 * 5 * 16);
    }

    #[test]
    fn weights_inner_offsets_pair_the_reduction_channel() {
        let fwd = WeightsLayout::new(&[16, 16, 1], false, WeightsInterleave::InputPairs);
        assert_eq!(fwd.offset(0, 0, 1, 0), 1);
        assert_eq!(fwd.offset(0, 1, 0, 0), 2);
        assert_eq!(fwd.offset(0, 0, 2, 0), 32);

        let bwd = WeightsLayout::new(&[16, 16, 1], false, WeightsInterleave::OutputPairs);
        assert_eq!(bwd.offset(0, 1, 0, 0), 1);
        assert_eq!(bwd.offset(0, 0, 1, 0), 2);
        assert_eq!(bwd.offset(0, 2, 0, 0), 32);
    }

    #[test]
    fn zero_pad_clears_only_tail_lanes() {
        let layout = ActivationLayout::new(&[1, 18, 2]);
        let mut data = vec![1.0f32; layout.padded_len()];
        zero_pad_channels(&mut data, &layout);
        for c in 0..layout.padded_channels() {
            for w in 0..2 {
                let value = data[layout.offset(0, c, 0, 0, w)];
                let expected = if c < 18 { 1.0 } else { 0.0 };
                assert_eq!(value, expected, "c={c} w={w}");
            }
        }
    }
}
