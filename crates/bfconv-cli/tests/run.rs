#[path = "../src/benchmark/mod.rs"]
mod benchmark;

use benchmark::problem::ConvShape;
use benchmark::run::{run, Dir, RunConfig};
use bfconv::{CpuEngine, CpuIsa, DataType};

fn engine(nthreads: usize) -> CpuEngine {
    bfconv_backend_ref_cpu::register_ref_cpu_impls();
    CpuEngine::new()
        .with_isa(CpuIsa::Avx512Core)
        .with_threads(nthreads)
}

fn config(dir: Dir, out_dt: DataType, bias: Option<DataType>) -> RunConfig {
    RunConfig {
        dir,
        out_dt,
        bias,
        iters: 2,
        seed: 7,
        check: true,
    }
}

#[test]
fn forward_run_checks_out() {
    let shape = ConvShape::parse("mb2ic20oc20_ih6iw7kh3kw3ph1pw1").unwrap();
    let report = run(
        &engine(2),
        &shape,
        &config(Dir::Fwd, DataType::F32, Some(DataType::F32)),
    )
    .unwrap();
    assert_eq!(report.impl_name, bfconv_backend_ref_cpu::REF_IMPL);
    assert_eq!(report.problem, "mb2ic20oc20_ih6oh6kh3sh1dh1ph1_iw7ow7kw3sw1dw1pw1");
    assert_eq!(report.iters, 2);
    assert!(report.min_ms <= report.avg_ms);
    let check = report.check.expect("check was requested");
    assert!(check.passed, "max_abs_diff={}", check.max_abs_diff);
}

#[test]
fn backward_data_run_checks_out() {
    let shape = ConvShape::parse("mb1g2ic32oc32_iw9kw3sw2pw1").unwrap();
    let report = run(&engine(3), &shape, &config(Dir::BwdD, DataType::Bf16, None)).unwrap();
    assert_eq!(report.scratchpad_bytes, 0);
    assert!(report.check.expect("check was requested").passed);
}

#[test]
fn report_serializes_without_a_check() {
    let shape = ConvShape::parse("mb1ic16oc16_iw8kw3").unwrap();
    let mut config = config(Dir::Fwd, DataType::F32, None);
    config.check = false;
    let report = run(&engine(1), &shape, &config).unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["dir"], "fwd");
    assert_eq!(json["iters"], 2);
    assert!(json.get("check").is_none());
}

#[test]
fn rejects_unusable_runs() {
    let shape = ConvShape::parse("mb1ic16oc16_iw8kw3").unwrap();
    let bwd_with_bias = config(Dir::BwdD, DataType::F32, Some(DataType::F32));
    assert!(run(&engine(1), &shape, &bwd_with_bias).is_err());

    let mut no_iters = config(Dir::Fwd, DataType::F32, None);
    no_iters.iters = 0;
    assert!(run(&engine(1), &shape, &no_iters).is_err());

    let scalar = CpuEngine::new().with_isa(CpuIsa::Avx2).with_threads(1);
    assert!(run(&scalar, &shape, &config(Dir::Fwd, DataType::F32, None)).is_err());
}
