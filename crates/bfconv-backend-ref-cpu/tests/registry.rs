use bfconv::primitive::registry::{create_primitive, list_impls};
use bfconv::{PrimitiveAttr, PrimitiveKind};
use bfconv_backend_ref_cpu::{register_ref_cpu_impls, REF_IMPL};
use bfconv_backend_tests::common::{engine, ConvProblem};

#[test]
fn reference_impl_is_registered() {
    register_ref_cpu_impls();
    let impls = list_impls();
    assert_eq!(
        impls.iter().filter(|name| name.as_str() == REF_IMPL).count(),
        1,
        "{impls:?}"
    );
}

#[test]
fn global_factory_creates_both_directions() {
    register_ref_cpu_impls();
    let problem = ConvProblem::new(2, 20, 32, &[10], &[3]);
    let attr = PrimitiveAttr::default();

    let fwd = create_primitive(&engine(2), &problem.forward_desc().unwrap(), &attr, None)
        .expect("forward primitive");
    assert_eq!(fwd.kind(), PrimitiveKind::ConvolutionForward);
    assert_eq!(fwd.impl_name(), REF_IMPL);

    let bwd = create_primitive(&engine(2), &problem.backward_data_desc().unwrap(), &attr, None)
        .expect("backward-data primitive");
    assert_eq!(bwd.kind(), PrimitiveKind::ConvolutionBackwardData);
    assert_eq!(bwd.impl_name(), REF_IMPL);
}
