use bfconv::layout::{
    reorder_activation_from_blocked, reorder_activation_to_blocked, reorder_weights_to_blocked,
    spatial_3d,
};
use bfconv::{
    ActivationLayout, AlgKind, ArgRole, ConvDesc, ConvError, ConvResult, CpuEngine, CpuIsa,
    DataType, ExecCtx, MemoryDesc, PropKind, TensorView, TensorViewMut, WeightsInterleave,
    WeightsLayout,
};
use half::bf16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const ATOL: f32 = 1e-3;
pub const RTOL: f32 = 1e-3;
/// Tolerance for outputs rounded to bf16.
pub const BF16_TOL: f32 = 1e-2;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Engine that passes the ISA check on any host.
pub fn engine(nthreads: usize) -> CpuEngine {
    CpuEngine::new()
        .with_isa(CpuIsa::Avx512Core)
        .with_threads(nthreads)
}

pub fn expect_unsupported<T>(result: ConvResult<T>, what: &str) {
    match result {
        Err(ConvError::Unsupported) => {}
        Err(other) => panic!("{what}: expected Unsupported, got {other}"),
        Ok(_) => panic!("{what}: expected Unsupported, primitive was created"),
    }
}

pub fn expect_invalid<T>(result: ConvResult<T>, what: &str) {
    match result {
        Err(ConvError::InvalidArguments(_)) => {}
        Err(other) => panic!("{what}: expected InvalidArguments, got {other}"),
        Ok(_) => panic!("{what}: expected InvalidArguments, call succeeded"),
    }
}

pub fn assert_close(expected: &[f32], actual: &[f32], atol: f32, rtol: f32) {
    assert_eq!(expected.len(), actual.len(), "length mismatch");
    for (i, (&e, &a)) in expected.iter().zip(actual).enumerate() {
        let diff = (e - a).abs();
        let tol = atol + rtol * e.abs();
        assert!(
            diff <= tol,
            "mismatch at {i}: expected {e}, got {a} (diff {diff}, tol {tol})"
        );
    }
}

/// Values exactly representable in bf16, drawn from `[-1, 1)`.
pub fn random_bf16(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len)
        .map(|_| bf16::from_f32(rng.gen_range(-1.0f32..1.0)).to_f32())
        .collect()
}

/// Host tensor of either element type the primitives accept.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
}

impl HostBuffer {
    pub fn from_f32(dtype: DataType, values: &[f32]) -> Self {
        match dtype {
            DataType::Bf16 => HostBuffer::Bf16(values.iter().copied().map(bf16::from_f32).collect()),
            _ => HostBuffer::F32(values.to_vec()),
        }
    }

    pub fn filled(dtype: DataType, len: usize, value: f32) -> Self {
        Self::from_f32(dtype, &vec![value; len])
    }

    pub fn dtype(&self) -> DataType {
        match self {
            HostBuffer::F32(_) => DataType::F32,
            HostBuffer::Bf16(_) => DataType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostBuffer::F32(data) => data.len(),
            HostBuffer::Bf16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn view(&self) -> TensorView<'_> {
        match self {
            HostBuffer::F32(data) => TensorView::from(data),
            HostBuffer::Bf16(data) => TensorView::from(data),
        }
    }

    pub fn view_mut(&mut self) -> TensorViewMut<'_> {
        match self {
            HostBuffer::F32(data) => TensorViewMut::from(data),
            HostBuffer::Bf16(data) => TensorViewMut::from(data),
        }
    }

    /// Every element, padded lanes included.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            HostBuffer::F32(data) => data.clone(),
            HostBuffer::Bf16(data) => data.iter().map(|v| v.to_f32()).collect(),
        }
    }

    /// Raw bit patterns, for bit-exact comparisons.
    pub fn to_bits(&self) -> Vec<u32> {
        match self {
            HostBuffer::F32(data) => data.iter().map(|v| v.to_bits()).collect(),
            HostBuffer::Bf16(data) => data.iter().map(|v| u32::from(v.to_bits())).collect(),
        }
    }

    /// Logical values of a blocked activation in plain `ncdhw` order.
    pub fn plain(&self, layout: &ActivationLayout) -> Vec<f32> {
        reorder_activation_from_blocked(&self.to_f32(), layout)
            .expect("blocked buffer shorter than its layout")
    }
}

/// One convolution problem in plain terms. Channel counts are totals across groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvProblem {
    pub mb: usize,
    pub groups: usize,
    pub ic: usize,
    pub oc: usize,
    pub input: Vec<usize>,
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub pad_l: Vec<usize>,
    pub pad_r: Vec<usize>,
    /// 1 is a dense kernel.
    pub dilation: Vec<usize>,
    pub bias: Option<DataType>,
    /// Type of the written tensor: dst forward, diff-src backward-data.
    pub out_dt: DataType,
}

impl ConvProblem {
    pub fn new(mb: usize, ic: usize, oc: usize, input: &[usize], kernel: &[usize]) -> Self {
        let nsp = input.len();
        Self {
            mb,
            groups: 1,
            ic,
            oc,
            input: input.to_vec(),
            kernel: kernel.to_vec(),
            strides: vec![1; nsp],
            pad_l: vec![0; nsp],
            pad_r: vec![0; nsp],
            dilation: vec![1; nsp],
            bias: None,
            out_dt: DataType::F32,
        }
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn strides(mut self, strides: &[usize]) -> Self {
        self.strides = strides.to_vec();
        self
    }

    pub fn padding(mut self, padding: &[usize]) -> Self {
        self.pad_l = padding.to_vec();
        self.pad_r = padding.to_vec();
        self
    }

    pub fn dilation(mut self, dilation: &[usize]) -> Self {
        self.dilation = dilation.to_vec();
        self
    }

    pub fn bias(mut self, dtype: DataType) -> Self {
        self.bias = Some(dtype);
        self
    }

    pub fn out_dt(mut self, dtype: DataType) -> Self {
        self.out_dt = dtype;
        self
    }

    pub fn output(&self) -> Vec<usize> {
        (0..self.input.len())
            .map(|axis| {
                let extent = (self.kernel[axis] - 1) * self.dilation[axis] + 1;
                (self.input[axis] + self.pad_l[axis] + self.pad_r[axis] - extent)
                    / self.strides[axis]
                    + 1
            })
            .collect()
    }

    pub fn src_dims(&self) -> Vec<usize> {
        [vec![self.mb, self.ic], self.input.clone()].concat()
    }

    pub fn dst_dims(&self) -> Vec<usize> {
        [vec![self.mb, self.oc], self.output()].concat()
    }

    pub fn weights_dims(&self) -> Vec<usize> {
        let per_group = vec![self.oc / self.groups, self.ic / self.groups];
        let head = if self.groups > 1 {
            [vec![self.groups], per_group].concat()
        } else {
            per_group
        };
        [head, self.kernel.clone()].concat()
    }

    fn with_geometry(&self, builder: bfconv::ConvDescBuilder) -> bfconv::ConvDescBuilder {
        builder
            .strides(&self.strides)
            .padding_lr(&self.pad_l, &self.pad_r)
            .dilation(&self.dilation)
    }

    pub fn forward_desc(&self) -> ConvResult<ConvDesc> {
        let mut builder = ConvDesc::builder(PropKind::ForwardTraining, AlgKind::Direct)
            .src(MemoryDesc::new(DataType::Bf16, &self.src_dims()))
            .weights(MemoryDesc::new(DataType::Bf16, &self.weights_dims()))
            .dst(MemoryDesc::new(self.out_dt, &self.dst_dims()));
        if let Some(dtype) = self.bias {
            builder = builder.bias(MemoryDesc::new(dtype, &[self.oc]));
        }
        self.with_geometry(builder).build()
    }

    pub fn backward_data_desc(&self) -> ConvResult<ConvDesc> {
        let builder = ConvDesc::builder(PropKind::BackwardData, AlgKind::Direct)
            .diff_src(MemoryDesc::new(self.out_dt, &self.src_dims()))
            .weights(MemoryDesc::new(DataType::Bf16, &self.weights_dims()))
            .diff_dst(MemoryDesc::new(DataType::Bf16, &self.dst_dims()));
        self.with_geometry(builder).build()
    }

    fn geometry(&self) -> Geometry {
        let sp = |values: &[usize], fill: usize| -> [usize; 3] {
            match *values {
                [w] => [fill, fill, w],
                [h, w] => [fill, h, w],
                [d, h, w] => [d, h, w],
                _ => [fill; 3],
            }
        };
        Geometry {
            icg: self.ic / self.groups,
            ocg: self.oc / self.groups,
            input: spatial_3d(&self.input),
            output: spatial_3d(&self.output()),
            kernel: spatial_3d(&self.kernel),
            strides: sp(&self.strides, 1),
            pad_l: sp(&self.pad_l, 0),
            dilation: sp(&self.dilation, 1),
        }
    }
}

struct Geometry {
    icg: usize,
    ocg: usize,
    input: [usize; 3],
    output: [usize; 3],
    kernel: [usize; 3],
    strides: [usize; 3],
    pad_l: [usize; 3],
    dilation: [usize; 3],
}

impl Geometry {
    /// Input coordinate read by output coordinate `o` through tap `k`, if inside the image.
    fn input_index(&self, axis: usize, o: usize, k: usize) -> Option<usize> {
        let i = (o * self.strides[axis] + k * self.dilation[axis]) as isize
            - self.pad_l[axis] as isize;
        (i >= 0 && (i as usize) < self.input[axis]).then_some(i as usize)
    }

    fn for_each_tap(&self, out: [usize; 3], mut f: impl FnMut(usize, usize)) {
        let [kd, kh, kw] = self.kernel;
        let [ih, iw] = [self.input[1], self.input[2]];
        for z in 0..kd {
            let Some(d) = self.input_index(0, out[0], z) else {
                continue;
            };
            for y in 0..kh {
                let Some(h) = self.input_index(1, out[1], y) else {
                    continue;
                };
                for x in 0..kw {
                    let Some(w) = self.input_index(2, out[2], x) else {
                        continue;
                    };
                    f((z * kh + y) * kw + x, (d * ih + h) * iw + w);
                }
            }
        }
    }
}

fn spatial_points(extents: [usize; 3]) -> impl Iterator<Item = [usize; 3]> {
    let [d, h, w] = extents;
    (0..d).flat_map(move |z| (0..h).flat_map(move |y| (0..w).map(move |x| [z, y, x])))
}

/// Naive forward convolution over plain tensors: `oscale * conv(src, weights) + bias`.
pub fn reference_forward(
    problem: &ConvProblem,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    oscale: f32,
) -> Vec<f32> {
    let geo = problem.geometry();
    let isp: usize = geo.input.iter().product();
    let osp: usize = geo.output.iter().product();
    let ksp: usize = geo.kernel.iter().product();
    let mut dst = vec![0.0f32; problem.mb * problem.oc * osp];
    for n in 0..problem.mb {
        for g in 0..problem.groups {
            for oc in 0..geo.ocg {
                let c_out = g * geo.ocg + oc;
                for (o, point) in spatial_points(geo.output).enumerate() {
                    let mut acc = 0.0f32;
                    for ic in 0..geo.icg {
                        let c_in = g * geo.icg + ic;
                        let src_base = (n * problem.ic + c_in) * isp;
                        let wei_base = ((g * geo.ocg + oc) * geo.icg + ic) * ksp;
                        geo.for_each_tap(point, |k, i| {
                            acc += src[src_base + i] * weights[wei_base + k];
                        });
                    }
                    let b = bias.map_or(0.0, |bias| bias[c_out]);
                    dst[(n * problem.oc + c_out) * osp + o] = oscale * acc + b;
                }
            }
        }
    }
    dst
}

/// Naive backward-data convolution over plain tensors.
pub fn reference_backward_data(
    problem: &ConvProblem,
    diff_dst: &[f32],
    weights: &[f32],
) -> Vec<f32> {
    let geo = problem.geometry();
    let isp: usize = geo.input.iter().product();
    let osp: usize = geo.output.iter().product();
    let ksp: usize = geo.kernel.iter().product();
    let mut diff_src = vec![0.0f32; problem.mb * problem.ic * isp];
    for n in 0..problem.mb {
        for g in 0..problem.groups {
            for oc in 0..geo.ocg {
                let c_out = g * geo.ocg + oc;
                for (o, point) in spatial_points(geo.output).enumerate() {
                    let dd = diff_dst[(n * problem.oc + c_out) * osp + o];
                    for ic in 0..geo.icg {
                        let c_in = g * geo.icg + ic;
                        let src_base = (n * problem.ic + c_in) * isp;
                        let wei_base = ((g * geo.ocg + oc) * geo.icg + ic) * ksp;
                        geo.for_each_tap(point, |k, i| {
                            diff_src[src_base + i] += dd * weights[wei_base + k];
                        });
                    }
                }
            }
        }
    }
    diff_src
}

/// Random forward operands in both plain and blocked form.
#[derive(Debug, Clone)]
pub struct ForwardCase {
    pub problem: ConvProblem,
    pub desc: ConvDesc,
    pub src_plain: Vec<f32>,
    pub weights_plain: Vec<f32>,
    pub bias_plain: Option<Vec<f32>>,
    pub src: HostBuffer,
    pub weights: HostBuffer,
    pub bias: Option<HostBuffer>,
    pub dst_layout: ActivationLayout,
}

impl ForwardCase {
    pub fn new(problem: ConvProblem, rng: &mut StdRng) -> Self {
        let desc = problem
            .forward_desc()
            .expect("forward descriptor should be well formed");
        let src_layout = ActivationLayout::new(desc.src_desc().dims());
        let weights_layout = WeightsLayout::new(
            desc.weights_desc().dims(),
            desc.with_groups(),
            WeightsInterleave::InputPairs,
        );
        let src_plain = random_bf16(rng, src_layout.logical_len());
        let weights_plain = random_bf16(rng, weights_layout.logical_len());
        // bf16 bias is compared against its rounded values.
        let bias_plain = problem.bias.map(|dtype| {
            let values: Vec<f32> = (0..problem.oc).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
            HostBuffer::from_f32(dtype, &values).to_f32()
        });
        let src = reorder_activation_to_blocked(&src_plain, &src_layout)
            .expect("plain source sized from its layout");
        let weights = reorder_weights_to_blocked(&weights_plain, &weights_layout)
            .expect("plain weights sized from their layout");
        let bias = problem
            .bias
            .zip(bias_plain.as_deref())
            .map(|(dtype, values)| HostBuffer::from_f32(dtype, values));
        Self {
            dst_layout: ActivationLayout::new(desc.dst_desc().dims()),
            desc,
            src: HostBuffer::from_f32(DataType::Bf16, &src),
            weights: HostBuffer::from_f32(DataType::Bf16, &weights),
            bias,
            src_plain,
            weights_plain,
            bias_plain,
            problem,
        }
    }

    /// Blocked destination with every lane, padding included, set to `value`.
    pub fn dst(&self, value: f32) -> HostBuffer {
        HostBuffer::filled(self.problem.out_dt, self.dst_layout.padded_len(), value)
    }

    /// Blocked destination holding `plain` in its logical lanes.
    pub fn dst_from_plain(&self, plain: &[f32]) -> HostBuffer {
        let blocked = reorder_activation_to_blocked(plain, &self.dst_layout)
            .expect("plain destination sized from its layout");
        HostBuffer::from_f32(self.problem.out_dt, &blocked)
    }

    pub fn ctx<'a>(&'a self, dst: &'a mut HostBuffer) -> ExecCtx<'a> {
        let ctx = ExecCtx::new()
            .arg(ArgRole::Src, self.src.view())
            .arg(ArgRole::Weights, self.weights.view())
            .arg_mut(ArgRole::Dst, dst.view_mut());
        match &self.bias {
            Some(bias) => ctx.arg(ArgRole::Bias, bias.view()),
            None => ctx,
        }
    }

    pub fn reference(&self, oscale: f32) -> Vec<f32> {
        reference_forward(
            &self.problem,
            &self.src_plain,
            &self.weights_plain,
            self.bias_plain.as_deref(),
            oscale,
        )
    }
}

/// Random backward-data operands in both plain and blocked form.
#[derive(Debug, Clone)]
pub struct BwdDataCase {
    pub problem: ConvProblem,
    pub desc: ConvDesc,
    pub diff_dst_plain: Vec<f32>,
    pub weights_plain: Vec<f32>,
    pub diff_dst: HostBuffer,
    pub weights: HostBuffer,
    pub diff_src_layout: ActivationLayout,
}

impl BwdDataCase {
    pub fn new(problem: ConvProblem, rng: &mut StdRng) -> Self {
        let desc = problem
            .backward_data_desc()
            .expect("backward-data descriptor should be well formed");
        let diff_dst_layout = ActivationLayout::new(desc.diff_dst_desc().dims());
        let weights_layout = WeightsLayout::new(
            desc.weights_desc().dims(),
            desc.with_groups(),
            WeightsInterleave::OutputPairs,
        );
        let diff_dst_plain = random_bf16(rng, diff_dst_layout.logical_len());
        let weights_plain = random_bf16(rng, weights_layout.logical_len());
        let diff_dst = reorder_activation_to_blocked(&diff_dst_plain, &diff_dst_layout)
            .expect("plain diff-dst sized from its layout");
        let weights = reorder_weights_to_blocked(&weights_plain, &weights_layout)
            .expect("plain weights sized from their layout");
        Self {
            diff_src_layout: ActivationLayout::new(desc.diff_src_desc().dims()),
            desc,
            diff_dst: HostBuffer::from_f32(DataType::Bf16, &diff_dst),
            weights: HostBuffer::from_f32(DataType::Bf16, &weights),
            diff_dst_plain,
            weights_plain,
            problem,
        }
    }

    pub fn diff_src(&self, value: f32) -> HostBuffer {
        HostBuffer::filled(self.problem.out_dt, self.diff_src_layout.padded_len(), value)
    }

    pub fn ctx<'a>(&'a self, diff_src: &'a mut HostBuffer) -> ExecCtx<'a> {
        ExecCtx::new()
            .arg(ArgRole::DiffDst, self.diff_dst.view())
            .arg(ArgRole::Weights, self.weights.view())
            .arg_mut(ArgRole::DiffSrc, diff_src.view_mut())
    }

    pub fn reference(&self) -> Vec<f32> {
        reference_backward_data(&self.problem, &self.diff_dst_plain, &self.weights_plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_forward_matches_hand_computed_1d() {
        // One channel, kernel [1, 2], input [1, 2, 3], pad 1 on both sides.
        let problem = ConvProblem::new(1, 1, 1, &[3], &[2]).padding(&[1]);
        assert_eq!(problem.output(), vec![4]);
        let dst = reference_forward(&problem, &[1.0, 2.0, 3.0], &[1.0, 2.0], Some(&[0.5]), 1.0);
        assert_eq!(dst, vec![2.5, 5.5, 8.5, 3.5]);
    }

    #[test]
    fn reference_backward_data_is_the_adjoint_of_forward() {
        let problem = ConvProblem::new(1, 2, 3, &[5], &[3]).strides(&[2]).padding(&[1]);
        let mut rng = seeded_rng(3);
        let src = random_bf16(&mut rng, 2 * 5);
        let weights = random_bf16(&mut rng, 3 * 2 * 3);
        let dd = random_bf16(&mut rng, 3 * problem.output()[0]);
        let y = reference_forward(&problem, &src, &weights, None, 1.0);
        let dx = reference_backward_data(&problem, &dd, &weights);
        let lhs: f32 = y.iter().zip(&dd).map(|(a, b)| a * b).sum();
        let rhs: f32 = src.iter().zip(&dx).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-4, "{lhs} vs {rhs}");
    }
}
