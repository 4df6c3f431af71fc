//! Portable reference kernels for `bfconv` primitives.
//!
//! The kernels read and write the same blocked layouts and scratchpad regions a generated
//! AVX-512 kernel would, with plain scalar loops underneath. They are the numerical baseline
//! the conformance suite and the CLI run against.

pub mod conf;
mod element;
pub mod fwd;
pub mod bwd_data;
pub mod partition;

use bfconv::primitive::registry::global_registry;
use bfconv::{ConvolutionBwdData, ConvolutionFwd, ConvolutionPrimitive};

pub use bwd_data::RefBwdDataKernel;
pub use conf::RefConvConf;
pub use fwd::RefFwdKernel;

pub type RefConvolutionFwd = ConvolutionFwd<RefFwdKernel>;
pub type RefConvolutionBwdData = ConvolutionBwdData<RefBwdDataKernel>;
pub type RefConvolution = ConvolutionPrimitive<RefFwdKernel, RefBwdDataKernel>;

/// Registry name of the reference implementation.
pub const REF_IMPL: &str = "ref_bf16:any";

/// Register the reference convolutions with the global implementation registry.
///
/// Called automatically on library load where supported; calling it again only refreshes the
/// existing entry.
pub fn register_ref_cpu_impls() {
    global_registry().register_primitive::<RefConvolution>(REF_IMPL);
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_REF_CPU_IMPLS: extern "C" fn() = {
    extern "C" fn register() {
        register_ref_cpu_impls();
    }
    register
};
