use std::env;
use std::sync::OnceLock;

use crate::cpu::CpuIsa;

static BFCONV_VERBOSE: OnceLock<bool> = OnceLock::new();
static BFCONV_MAX_CPU_ISA: OnceLock<Option<CpuIsa>> = OnceLock::new();
static BFCONV_NUM_THREADS: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// `BFCONV_VERBOSE`: emit one info event per primitive execution.
pub(crate) fn verbose_enabled() -> bool {
    *BFCONV_VERBOSE.get_or_init(|| non_empty_var("BFCONV_VERBOSE").is_some_and(|v| parse_bool(&v)))
}

/// `BFCONV_MAX_CPU_ISA`: upper bound on the ISA the engine reports, e.g. `avx2`.
pub(crate) fn max_cpu_isa() -> Option<CpuIsa> {
    *BFCONV_MAX_CPU_ISA.get_or_init(|| {
        let value = non_empty_var("BFCONV_MAX_CPU_ISA")?;
        match value.parse::<CpuIsa>() {
            Ok(isa) => Some(isa),
            Err(_) => {
                tracing::warn!(value = %value, "ignoring unrecognized BFCONV_MAX_CPU_ISA");
                None
            }
        }
    })
}

/// `BFCONV_NUM_THREADS`: thread count handed to kernel configuration.
pub(crate) fn num_threads() -> Option<usize> {
    *BFCONV_NUM_THREADS.get_or_init(|| {
        non_empty_var("BFCONV_NUM_THREADS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
    })
}
