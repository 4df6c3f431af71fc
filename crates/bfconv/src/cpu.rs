//! Host CPU capability detection and the engine handed to primitive creation.

use std::fmt;
use std::str::FromStr;

use crate::env;

/// Instruction-set levels, ordered from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CpuIsa {
    /// Baseline; no vector extension assumed.
    Any,
    Sse41,
    Avx2,
    /// AVX-512 F + BW + VL + DQ.
    Avx512Core,
}

impl CpuIsa {
    pub fn name(self) -> &'static str {
        match self {
            CpuIsa::Any => "any",
            CpuIsa::Sse41 => "sse41",
            CpuIsa::Avx2 => "avx2",
            CpuIsa::Avx512Core => "avx512_core",
        }
    }

    /// Detects the running CPU.
    pub fn detect() -> CpuIsa {
        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("avx512f")
                && std::is_x86_feature_detected!("avx512bw")
                && std::is_x86_feature_detected!("avx512vl")
                && std::is_x86_feature_detected!("avx512dq")
            {
                return CpuIsa::Avx512Core;
            }
            if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
                return CpuIsa::Avx2;
            }
            if std::is_x86_feature_detected!("sse4.1") {
                return CpuIsa::Sse41;
            }
        }
        CpuIsa::Any
    }
}

impl fmt::Display for CpuIsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCpuIsaError(String);

impl fmt::Display for ParseCpuIsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cpu isa '{}'", self.0)
    }
}

impl std::error::Error for ParseCpuIsaError {}

impl FromStr for CpuIsa {
    type Err = ParseCpuIsaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "none" => Ok(CpuIsa::Any),
            "sse41" | "sse4.1" => Ok(CpuIsa::Sse41),
            "avx2" => Ok(CpuIsa::Avx2),
            "avx512_core" | "avx512" | "all" => Ok(CpuIsa::Avx512Core),
            other => Err(ParseCpuIsaError(other.to_string())),
        }
    }
}

/// Execution environment a primitive is created for.
///
/// Carries the usable ISA and the thread count kernel configuration should plan for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuEngine {
    isa: CpuIsa,
    nthreads: usize,
}

impl CpuEngine {
    /// Detected ISA capped by `BFCONV_MAX_CPU_ISA`, threads from `BFCONV_NUM_THREADS` or the
    /// rayon pool size.
    pub fn new() -> Self {
        let detected = CpuIsa::detect();
        let isa = match env::max_cpu_isa() {
            Some(cap) => detected.min(cap),
            None => detected,
        };
        let nthreads = env::num_threads().unwrap_or_else(rayon::current_num_threads);
        Self {
            isa,
            nthreads: nthreads.max(1),
        }
    }

    /// Overrides the ISA, e.g. to run the portable reference kernel on any host.
    pub fn with_isa(mut self, isa: CpuIsa) -> Self {
        self.isa = isa;
        self
    }

    pub fn with_threads(mut self, nthreads: usize) -> Self {
        self.nthreads = nthreads.max(1);
        self
    }

    pub fn isa(&self) -> CpuIsa {
        self.isa
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn mayiuse(&self, isa: CpuIsa) -> bool {
        self.isa >= isa
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isa_ordering_and_parsing() {
        assert!(CpuIsa::Avx512Core > CpuIsa::Avx2);
        assert_eq!("AVX512_CORE".parse::<CpuIsa>(), Ok(CpuIsa::Avx512Core));
        assert_eq!("avx2".parse::<CpuIsa>(), Ok(CpuIsa::Avx2));
        assert!("avx10".parse::<CpuIsa>().is_err());
    }

    #[test]
    fn engine_overrides() {
        let engine = CpuEngine::new().with_isa(CpuIsa::Avx2).with_threads(0);
        assert!(!engine.mayiuse(CpuIsa::Avx512Core));
        assert!(engine.mayiuse(CpuIsa::Sse41));
        assert_eq!(engine.nthreads(), 1);
    }
}
