use std::ops::Range;

use bfconv::layout::BLOCK;
use bfconv::{
    ConvDesc, ConvError, ConvLayouts, ConvResult, Direction, EltwiseAlg, ForwardArgs,
    ForwardKernel, PostOp, PrimitiveAttr, ScratchpadGrant, ScratchpadKey, TensorView,
    TensorViewMut,
};
use half::bf16;
use tracing::trace;

use crate::conf::RefConvConf;
use crate::element::Element;
use crate::partition::{balance211, split_by_ranges};

/// Fused epilogue: `eltwise(oscale * acc + bias + sum_scale * prev)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Epilogue {
    oscale: f32,
    sum_scale: Option<f32>,
    eltwise: Option<(EltwiseAlg, f32, f32)>,
}

impl Epilogue {
    fn from_attr(attr: &PrimitiveAttr) -> Self {
        let mut epilogue = Self {
            oscale: attr.output_scale(),
            sum_scale: None,
            eltwise: None,
        };
        for op in attr.post_ops().ops() {
            match *op {
                PostOp::Sum { scale } => epilogue.sum_scale = Some(scale),
                PostOp::Eltwise { alg, alpha, beta } => {
                    epilogue.eltwise = Some((alg, alpha, beta));
                }
            }
        }
        epilogue
    }

    #[inline]
    fn apply(&self, acc: f32, bias: f32, prev: f32) -> f32 {
        let mut value = self.oscale * acc + bias;
        if let Some(scale) = self.sum_scale {
            value += scale * prev;
        }
        if let Some((alg, alpha, beta)) = self.eltwise {
            value = alg.apply(value, alpha, beta);
        }
        value
    }
}

/// Scalar forward kernel over the blocked layouts, bf16 operands with f32 accumulation.
#[derive(Debug)]
pub struct RefFwdKernel {
    conf: RefConvConf,
    epilogue: Epilogue,
}

/// Read-only state shared by every thread of one execution.
struct FwdPass<'a> {
    conf: &'a RefConvConf,
    src: &'a [bf16],
    weights: &'a [bf16],
    bias: Option<TensorView<'a>>,
    epilogue: Epilogue,
}

impl FwdPass<'_> {
    fn unit_coords(&self, unit: usize) -> (usize, usize, usize) {
        let ocb = unit % self.conf.nb_oc;
        let rest = unit / self.conf.nb_oc;
        (rest / self.conf.ngroups, rest % self.conf.ngroups, ocb)
    }

    fn ic_lanes(&self, icb: usize) -> usize {
        (self.conf.ic - icb * BLOCK).min(BLOCK)
    }

    /// Copies input channel blocks `icbs` of image `(n, g)` into a zero-padded f32 buffer laid
    /// out as `[icb][pd][ph][pw][16]`.
    fn stage_src(&self, n: usize, g: usize, icbs: Range<usize>, staged: &mut [f32]) {
        let conf = self.conf;
        let [pd, ph, pw] = conf.padded_src_spatial();
        let [id, ih, iw] = conf.src.spatial;
        let plane = pd * ph * pw * BLOCK;
        for icb in icbs {
            let lanes = self.ic_lanes(icb);
            let dst = &mut staged[icb * plane..(icb + 1) * plane];
            dst.fill(0.0);
            let c = g * conf.ic + icb * BLOCK;
            for d in 0..id {
                for h in 0..ih {
                    for w in 0..iw {
                        let from = conf.src.offset(n, c, d, h, w);
                        let to = (((d + conf.pad_l[0]) * ph + h + conf.pad_l[1]) * pw
                            + w
                            + conf.pad_l[2])
                            * BLOCK;
                        for lane in 0..lanes {
                            dst[to + lane] = self.src[from + lane].to_f32();
                        }
                    }
                }
            }
        }
    }

    /// Raw convolution sums of all 16 output lanes of block `ocb` at one output point.
    fn accumulate(
        &self,
        n: usize,
        g: usize,
        ocb: usize,
        icbs: Range<usize>,
        point: [usize; 3],
        staged: Option<&[f32]>,
    ) -> [f32; BLOCK] {
        let conf = self.conf;
        let [kd, kh, kw] = conf.kernel();
        let [pd, ph, pw] = conf.padded_src_spatial();
        let mut acc = [0.0f32; BLOCK];
        let mut lanes = [0.0f32; BLOCK];
        for icb in icbs {
            let nlanes = self.ic_lanes(icb);
            for z in 0..kd {
                for y in 0..kh {
                    for x in 0..kw {
                        // Position in padded source coordinates.
                        let pos = [
                            point[0] * conf.stride[0] + z * conf.dilate[0],
                            point[1] * conf.stride[1] + y * conf.dilate[1],
                            point[2] * conf.stride[2] + x * conf.dilate[2],
                        ];
                        match staged {
                            Some(staged) => {
                                let s = ((icb * pd + pos[0]) * ph + pos[1]) * pw + pos[2];
                                let base = s * BLOCK;
                                lanes[..nlanes].copy_from_slice(&staged[base..base + nlanes]);
                            }
                            None => {
                                let c = g * conf.ic + icb * BLOCK;
                                let base = conf.src.offset(n, c, pos[0], pos[1], pos[2]);
                                for (lane, value) in lanes[..nlanes].iter_mut().enumerate() {
                                    *value = self.src[base + lane].to_f32();
                                }
                            }
                        }
                        let k = conf.weights.kernel_index(z, y, x);
                        let wbase = conf.weights.block_offset(g, ocb, icb, k);
                        for (icl, &value) in lanes[..nlanes].iter().enumerate() {
                            for (ocl, slot) in acc.iter_mut().enumerate() {
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

    fn bias_at(&self, channel: usize) -> f32 {
        match self.bias {
            Some(TensorView::F32(bias)) => bias[channel],
            Some(TensorView::Bf16(bias)) => bias[channel].to_f32(),
            None => 0.0,
        }
    }

    /// Applies the epilogue to one output point and stores all 16 lanes.
    fn store<T: Element>(&self, g: usize, ocb: usize, acc: &[f32; BLOCK], out: &mut [T]) {
        let channel = g * self.conf.oc + ocb * BLOCK;
        for (lane, (slot, &value)) in out.iter_mut().zip(acc.iter()).enumerate() {
            let bias = self.bias_at(channel + lane);
            *slot = T::from_f32(self.epilogue.apply(value, bias, slot.to_f32()));
        }
    }

    fn for_each_point(&self, mut f: impl FnMut(usize, [usize; 3])) {
        let [od, oh, ow] = self.conf.dst.spatial;
        for d in 0..od {
            for h in 0..oh {
                for w in 0..ow {
                    f(self.conf.dst.spatial_index(d, h, w), [d, h, w]);
                }
            }
        }
    }

    /// One thread's share of the single-pass schedule: whole units, reduced and stored.
    fn run_units<T: Element>(
        &self,
        units: Range<usize>,
        dst: &mut [T],
        mut staged: Option<&mut [f32]>,
    ) {
        let conf = self.conf;
        let chunk = conf.dst.block_len();
        let mut staged_image = None;
        for (unit, out) in units.zip(dst.chunks_exact_mut(chunk)) {
            let (n, g, ocb) = self.unit_coords(unit);
            if let Some(buffer) = staged.as_deref_mut() {
                if staged_image != Some((n, g)) {
                    self.stage_src(n, g, 0..conf.nb_ic, buffer);
                    staged_image = Some((n, g));
                }
            }
            let staged = staged.as_deref();
            self.for_each_point(|s, point| {
                let acc = self.accumulate(n, g, ocb, 0..conf.nb_ic, point, staged);
                self.store(g, ocb, &acc, &mut out[s * BLOCK..(s + 1) * BLOCK]);
            });
        }
    }

    /// First phase of the split schedule: job `job` reduces its share of the input channel
    /// blocks of one unit into `partial`.
    fn run_partial(&self, job: usize, partial: &mut [f32], staged: Option<&mut [f32]>) {
        let conf = self.conf;
        let unit = job / conf.nthr_ic;
        let icbs = balance211(conf.nb_ic, conf.nthr_ic, job % conf.nthr_ic);
        let (n, g, ocb) = self.unit_coords(unit);
        let staged = staged.map(|buffer| {
            self.stage_src(n, g, icbs.clone(), buffer);
            &*buffer
        });
        self.for_each_point(|s, point| {
            let acc = self.accumulate(n, g, ocb, icbs.clone(), point, staged);
            partial[s * BLOCK..(s + 1) * BLOCK].copy_from_slice(&acc);
        });
    }

    /// Second phase: sums the partials of `unit` in job order and stores the result.
    fn reduce_unit<T: Element>(&self, unit: usize, partials: &[f32], out: &mut [T]) {
        let conf = self.conf;
        let chunk = conf.dst.block_len();
        let (_, g, ocb) = self.unit_coords(unit);
        let first = unit * conf.nthr_ic;
        self.for_each_point(|s, _| {
            let mut acc = [0.0f32; BLOCK];
            for part in 0..conf.nthr_ic {
                let base = (first + part) * chunk + s * BLOCK;
                for (slot, &value) in acc.iter_mut().zip(&partials[base..base + BLOCK]) {
                    *slot += value;
                }
            }
            self.store(g, ocb, &acc, &mut out[s * BLOCK..(s + 1) * BLOCK]);
        });
    }

    fn execute<T: Element>(
        &self,
        dst: &mut [T],
        grant: &mut ScratchpadGrant<'_>,
    ) -> ConvResult<()> {
        let conf = self.conf;
        let chunk = conf.dst.block_len();
        let dst = &mut dst[..conf.work_amount * chunk];

        let staged_len = conf.src_transpose_len();
        let mut staged: Vec<Option<&mut [f32]>> = if staged_len > 0 {
            let region: &mut [f32] = grant.take(ScratchpadKey::ConvTrSrc)?;
            region.chunks_exact_mut(staged_len).map(Some).collect()
        } else {
            Vec::new()
        };
        staged.resize_with(conf.nthr, || None);

        if conf.nthr_ic > 1 {
            let partials: &mut [f32] = grant.take(ScratchpadKey::ConvPartialSums)?;
            let njobs = conf.work_amount * conf.nthr_ic;
            if partials.len() < njobs * chunk {
                return Err(ConvError::execution(
                    "partial-sum region smaller than the job count",
                ));
            }
            rayon::scope(|scope| {
                let jobs = partials.chunks_exact_mut(chunk).zip(staged.iter_mut());
                for (job, (partial, staged)) in jobs.take(njobs).enumerate() {
                    let staged = staged.take();
                    scope.spawn(move |_| self.run_partial(job, partial, staged));
                }
            });
            let partials = &*partials;
            let team = conf.nthr.min(conf.work_amount);
            let ranges: Vec<Range<usize>> = (0..team)
                .map(|tid| balance211(conf.work_amount, team, tid))
                .collect();
            let pieces = split_by_ranges(dst, &ranges, chunk);
            rayon::scope(|scope| {
                for (range, piece) in ranges.iter().cloned().zip(pieces) {
                    scope.spawn(move |_| {
                        for (unit, out) in range.zip(piece.chunks_exact_mut(chunk)) {
                            self.reduce_unit(unit, partials, out);
                        }
                    });
                }
            });
            return Ok(());
        }

        let ranges: Vec<Range<usize>> = (0..conf.nthr)
            .map(|tid| balance211(conf.work_amount, conf.nthr, tid))
            .collect();
        let pieces = split_by_ranges(dst, &ranges, chunk);
        rayon::scope(|scope| {
            for ((range, piece), staged) in ranges.iter().cloned().zip(pieces).zip(staged) {
                scope.spawn(move |_| self.run_units(range, piece, staged));
            }
        });
        Ok(())
    }
}

impl ForwardKernel for RefFwdKernel {
    type Config = RefConvConf;

    const IMPL_NAME: &'static str = "ref_bf16:any";

    fn init_conf(
        desc: &ConvDesc,
        layouts: &ConvLayouts,
        attr: &PrimitiveAttr,
        nthreads: usize,
    ) -> Option<RefConvConf> {
        let conf = RefConvConf::init(desc, layouts, attr, nthreads, Direction::Forward)?;
        trace!(
            nthr = conf.nthr,
            nthr_ic = conf.nthr_ic,
            work_amount = conf.work_amount,
            src_transpose = conf.with_src_transpose,
            "forward configuration"
        );
        Some(conf)
    }

    fn new(conf: &RefConvConf, attr: &PrimitiveAttr) -> ConvResult<Self> {
        Ok(Self {
            conf: conf.clone(),
            epilogue: Epilogue::from_attr(attr),
        })
    }

    fn run(&self, args: ForwardArgs<'_>, scratchpad: &mut ScratchpadGrant<'_>) -> ConvResult<()> {
        let ForwardArgs {
            src,
            weights,
            bias,
            mut dst,
        } = args;
        let pass = FwdPass {
            conf: &self.conf,
            src,
            weights,
            bias,
            epilogue: self.epilogue,
        };
        match &mut dst {
            TensorViewMut::F32(data) => pass.execute(&mut data[..], scratchpad),
            TensorViewMut::Bf16(data) => pass.execute(&mut data[..], scratchpad),
        }
    }
}
