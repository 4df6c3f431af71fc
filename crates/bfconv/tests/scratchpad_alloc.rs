//! Library-mode execution reuses the scratchpad allocated at creation. The counting allocator
//! lives in its own test binary so it sees no other test's allocations.

mod common;

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use bfconv::{
    ArgRole, ConvolutionBwdData, ConvolutionFwd, DataType, ExecCtx, Primitive, PrimitiveAttr,
};
use common::{backward_data_desc, engine, forward_desc, MockBwdData, MockFwd};
use half::bf16;

struct CountingAlloc;

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

fn allocations_during<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let before = ALLOCATIONS.with(Cell::get);
    let result = f();
    (result, ALLOCATIONS.with(Cell::get) - before)
}

#[test]
fn forward_execution_allocates_nothing_after_creation() {
    let engine = engine(2);
    let desc = forward_desc(1, 20, 20, Some(DataType::F32), DataType::F32);
    let primitive =
        ConvolutionFwd::<MockFwd>::create(&engine, &desc, &PrimitiveAttr::default(), None).unwrap();
    assert!(primitive.scratchpad_size() > 0);

    let src = vec![bf16::ZERO; 32 * 10];
    let weights = vec![bf16::ZERO; 2 * 2 * 3 * 256];
    let bias = vec![0.5f32; 20];
    let mut dst = vec![0.0f32; 32 * 8];
    for call in 0..3 {
        let ctx = ExecCtx::new()
            .arg(ArgRole::Src, &src)
            .arg(ArgRole::Weights, &weights)
            .arg(ArgRole::Bias, &bias)
            .arg_mut(ArgRole::Dst, &mut dst);
        let (result, allocations) = allocations_during(|| primitive.execute(ctx));
        result.unwrap();
        // The first call may initialise process-wide settings.
        if call > 0 {
            assert_eq!(allocations, 0, "call {call} allocated");
        }
    }
}

#[test]
fn backward_data_execution_allocates_nothing_after_creation() {
    let engine = engine(2);
    let desc = backward_data_desc(1, 20, 20, DataType::F32);
    let primitive =
        ConvolutionBwdData::<MockBwdData>::create(&engine, &desc, &PrimitiveAttr::default(), None)
            .unwrap();
    assert!(primitive.scratchpad_size() > 0);

    let diff_dst = vec![bf16::ZERO; 32 * 8];
    let weights = vec![bf16::ZERO; 2 * 2 * 3 * 256];
    let mut diff_src = vec![0.0f32; 32 * 10];
    for call in 0..3 {
        let ctx = ExecCtx::new()
            .arg(ArgRole::DiffDst, &diff_dst)
            .arg(ArgRole::Weights, &weights)
            .arg_mut(ArgRole::DiffSrc, &mut diff_src);
        let (result, allocations) = allocations_during(|| primitive.execute(ctx));
        result.unwrap();
        if call > 0 {
            assert_eq!(allocations, 0, "call {call} allocated");
        }
    }
}
