use std::time::Instant;

use anyhow::{bail, Context, Result};
use bfconv::primitive::registry::create_primitive;
use bfconv::{CpuEngine, DataType, Primitive, PrimitiveAttr};
use bfconv_backend_tests::common::{
    seeded_rng, BwdDataCase, ConvProblem, ForwardCase, ATOL, BF16_TOL, RTOL,
};
use clap::ValueEnum;
use serde::Serialize;

use super::problem::ConvShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dir {
    Fwd,
    #[value(name = "bwd_d")]
    BwdD,
}

impl Dir {
    pub fn name(self) -> &'static str {
        match self {
            Dir::Fwd => "fwd",
            Dir::BwdD => "bwd_d",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dir: Dir,
    /// Destination type for forward, diff-src type for backward-data.
    pub out_dt: DataType,
    pub bias: Option<DataType>,
    pub iters: usize,
    pub seed: u64,
    pub check: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub max_abs_diff: f32,
    pub mismatches: usize,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub problem: String,
    pub dir: Dir,
    pub impl_name: String,
    pub nthreads: usize,
    pub scratchpad_bytes: usize,
    pub iters: usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub gflops: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckReport>,
}

impl Report {
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {} impl={} threads={} scratchpad={}B min={:.3}ms avg={:.3}ms {:.2} GFLOP/s",
            self.problem,
            self.dir.name(),
            self.impl_name,
            self.nthreads,
            self.scratchpad_bytes,
            self.min_ms,
            self.avg_ms,
            self.gflops,
        );
        if let Some(check) = &self.check {
            let verdict = if check.passed { "passed" } else { "FAILED" };
            line.push_str(&format!(
                " check={verdict} max_abs_diff={:.3e} mismatches={}",
                check.max_abs_diff, check.mismatches
            ));
        }
        line
    }
}

pub fn conv_problem(shape: &ConvShape, config: &RunConfig) -> ConvProblem {
    let mut problem = ConvProblem::new(shape.mb, shape.ic, shape.oc, &shape.input, &shape.kernel)
        .groups(shape.groups)
        .strides(&shape.strides)
        .dilation(&shape.dilation)
        .out_dt(config.out_dt);
    problem.pad_l = shape.pad_l.clone();
    problem.pad_r = shape.pad_r.clone();
    match config.bias {
        Some(dtype) => problem.bias(dtype),
        None => problem,
    }
}

fn compare(expected: &[f32], actual: &[f32], dtype: DataType) -> CheckReport {
    let (atol, rtol) = match dtype {
        DataType::Bf16 => (BF16_TOL, BF16_TOL),
        _ => (ATOL, RTOL),
    };
    let mut max_abs_diff = 0.0f32;
    let mut mismatches = 0;
    for (e, a) in expected.iter().zip(actual) {
        let diff = (e - a).abs();
        max_abs_diff = max_abs_diff.max(diff);
        if diff > atol + rtol * e.abs() {
            mismatches += 1;
        }
    }
    CheckReport {
        max_abs_diff,
        mismatches,
        passed: mismatches == 0,
    }
}

/// One untimed warm-up call, then `iters` timed ones; returns min and mean milliseconds.
fn time_executions<F>(iters: usize, mut body: F) -> Result<(f64, f64)>
where
    F: FnMut() -> Result<()>,
{
    body()?;
    let mut min_ms = f64::INFINITY;
    let mut total_ms = 0.0;
    for _ in 0..iters {
        let start = Instant::now();
        body()?;
        let ms = start.elapsed().as_secs_f64() * 1e3;
        min_ms = min_ms.min(ms);
        total_ms += ms;
    }
    Ok((min_ms, total_ms / iters as f64))
}

/// Creates the primitive through the global registry, times `iters` executions after a warm-up
/// and optionally checks the last output against the naive convolution.
pub fn run(engine: &CpuEngine, shape: &ConvShape, config: &RunConfig) -> Result<Report> {
    if config.iters == 0 {
        bail!("--iters must be at least 1");
    }
    if config.dir == Dir::BwdD && config.bias.is_some() {
        bail!("backward-data has no bias");
    }
    let problem = conv_problem(shape, config);
    let desc = match config.dir {
        Dir::Fwd => problem.forward_desc(),
        Dir::BwdD => problem.backward_data_desc(),
    }
    .context("building the convolution descriptor")?;
    let problem_string = desc.problem_string();

    let primitive = create_primitive(engine, &desc, &PrimitiveAttr::default(), None)
        .with_context(|| format!("no implementation for {problem_string}"))?;
    let mut scratchpad = primitive
        .create_scratchpad()
        .context("allocating the scratchpad")?;
    tracing::info!(
        problem = %problem_string,
        impl_name = primitive.impl_name(),
        scratchpad = scratchpad.size(),
        "created primitive"
    );

    let mut rng = seeded_rng(config.seed);
    let (timings, output, expected, layout) = match config.dir {
        Dir::Fwd => {
            let case = ForwardCase::new(problem, &mut rng);
            let mut dst = case.dst(0.0);
            let timings = time_executions(config.iters, || {
                primitive
                    .execute(case.ctx(&mut dst).scratchpad(&mut scratchpad))
                    .context("forward execution")
            })?;
            let expected = config.check.then(|| case.reference(1.0));
            (timings, dst, expected, case.dst_layout)
        }
        Dir::BwdD => {
            let case = BwdDataCase::new(problem, &mut rng);
            let mut diff_src = case.diff_src(0.0);
            let timings = time_executions(config.iters, || {
                primitive
                    .execute(case.ctx(&mut diff_src).scratchpad(&mut scratchpad))
                    .context("backward-data execution")
            })?;
            let expected = config.check.then(|| case.reference());
            (timings, diff_src, expected, case.diff_src_layout)
        }
    };
    let (min_ms, avg_ms) = timings;
    let check = expected.map(|expected| {
        compare(&expected, &output.plain(&layout), config.out_dt)
    });
    if let Some(check) = &check {
        tracing::debug!(max_abs_diff = check.max_abs_diff, "checked against reference");
    }

    Ok(Report {
        problem: problem_string,
        dir: config.dir,
        impl_name: primitive.impl_name().to_string(),
        nthreads: engine.nthreads(),
        scratchpad_bytes: scratchpad.size(),
        iters: config.iters,
        min_ms,
        avg_ms,
        gflops: shape.flops() / (min_ms * 1e6),
        check,
    })
}
