use std::ops::Range;

use bfconv::layout::BLOCK;
use bfconv::{
    BackwardDataKernel, BwdDataArgs, ConvDesc, ConvLayouts, ConvResult, Direction, PrimitiveAttr,
    ScratchpadGrant, TensorViewMut,
};
use half::bf16;
use tracing::trace;

use crate::conf::RefConvConf;
use crate::element::Element;
use crate::partition::{balance211, split_by_ranges};

/// Scalar backward-data kernel: scatters diff-dst back through the weights, computed as a
/// gather per diff-src point.
#[derive(Debug)]
pub struct RefBwdDataKernel {
    conf: RefConvConf,
}

struct BwdDataPass<'a> {
    conf: &'a RefConvConf,
    diff_dst: &'a [bf16],
    weights: &'a [bf16],
}

impl BwdDataPass<'_> {
    /// Output index along `axis` that input index `i` contributes to through tap `k`, if any.
    #[inline]
    fn output_index(&self, axis: usize, i: usize, k: usize) -> Option<usize> {
        let conf = self.conf;
        let t = (i + conf.pad_l[axis]).checked_sub(k * conf.dilate[axis])?;
        if t % conf.stride[axis] != 0 {
            return None;
        }
        let o = t / conf.stride[axis];
        (o < conf.dst.spatial[axis]).then_some(o)
    }

    fn unit_coords(&self, unit: usize) -> (usize, usize, usize) {
        let icb = unit % self.conf.nb_ic;
        let rest = unit / self.conf.nb_ic;
        (rest / self.conf.ngroups, rest % self.conf.ngroups, icb)
    }

    fn oc_lanes(&self, ocb: usize) -> usize {
        (self.conf.oc - ocb * BLOCK).min(BLOCK)
    }

    /// All 16 input-channel lanes of block `icb` at diff-src point `point`.
    fn accumulate(&self, n: usize, g: usize, icb: usize, point: [usize; 3]) -> [f32; BLOCK] {
        let conf = self.conf;
        let [kd, kh, kw] = conf.kernel();
        let mut acc = [0.0f32; BLOCK];
        for z in 0..kd {
            let Some(od) = self.output_index(0, point[0], z) else {
                continue;
            };
            for y in 0..kh {
                let Some(oh) = self.output_index(1, point[1], y) else {
                    continue;
                };
                for x in 0..kw {
                    let Some(ow) = self.output_index(2, point[2], x) else {
                        continue;
                    };
                    let k = conf.weights.kernel_index(z, y, x);
                    for ocb in 0..conf.nb_oc {
                        let c = g * conf.oc + ocb * BLOCK;
                        let base = conf.dst.offset(n, c, od, oh, ow);
                        let wbase = conf.weights.block_offset(g, ocb, icb, k);
                        for ocl in 0..self.oc_lanes(ocb) {
                            let value = self.diff_dst[base + ocl].to_f32();
                            for (icl, slot) in acc.iter_mut().enumerate() {
                                let w = self.weights[wbase + conf.weights.inner_offset(ocl, icl)];
                                *slot += value * w.to_f32();
                            }
                        }
                    }
                }
            }
        }
        acc
    }

    fn run_units<T: Element>(&self, units: Range<usize>, diff_src: &mut [T]) {
        let conf = self.conf;
        let chunk = conf.src.block_len();
        let [id, ih, iw] = conf.src.spatial;
        for (unit, out) in units.zip(diff_src.chunks_exact_mut(chunk)) {
            let (n, g, icb) = self.unit_coords(unit);
            for d in 0..id {
                for h in 0..ih {
                    for w in 0..iw {
                        let acc = self.accumulate(n, g, icb, [d, h, w]);
                        let s = conf.src.spatial_index(d, h, w);
                        for (slot, value) in out[s * BLOCK..(s + 1) * BLOCK].iter_mut().zip(acc) {
                            *slot = T::from_f32(value);
                        }
                    }
                }
            }
        }
    }

    fn execute<T: Element>(&self, diff_src: &mut [T]) {
        let conf = self.conf;
        let chunk = conf.src.block_len();
        let diff_src = &mut diff_src[..conf.work_amount * chunk];
        let ranges: Vec<Range<usize>> = (0..conf.nthr)
            .map(|tid| balance211(conf.work_amount, conf.nthr, tid))
            .collect();
        let pieces = split_by_ranges(diff_src, &ranges, chunk);
        rayon::scope(|scope| {
            for (range, piece) in ranges.iter().cloned().zip(pieces) {
                scope.spawn(move |_| self.run_units(range, piece));
            }
        });
    }
}

impl BackwardDataKernel for RefBwdDataKernel {
    type Config = RefConvConf;

    const IMPL_NAME: &'static str = "ref_bf16:any";

    fn init_conf(
        desc: &ConvDesc,
        layouts: &ConvLayouts,
        attr: &PrimitiveAttr,
        nthreads: usize,
    ) -> Option<RefConvConf> {
        let conf = RefConvConf::init(desc, layouts, attr, nthreads, Direction::BackwardData)?;
        trace!(
            nthr = conf.nthr,
            work_amount = conf.work_amount,
            "backward-data configuration"
        );
        Some(conf)
    }

    fn new(conf: &RefConvConf, _attr: &PrimitiveAttr) -> ConvResult<Self> {
        Ok(Self { conf: conf.clone() })
    }

    fn run(&self, args: BwdDataArgs<'_>, _scratchpad: &mut ScratchpadGrant<'_>) -> ConvResult<()> {
        let BwdDataArgs {
            diff_dst,
            weights,
            mut diff_src,
        } = args;
        let pass = BwdDataPass {
            conf: &self.conf,
            diff_dst,
            weights,
        };
        match &mut diff_src {
            TensorViewMut::F32(data) => pass.execute(&mut data[..]),
            TensorViewMut::Bf16(data) => pass.execute(&mut data[..]),
        }
        Ok(())
    }
}
