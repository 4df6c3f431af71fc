//! Primitive attributes: output scaling, fused post-ops and scratchpad ownership.

use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EltwiseAlg {
    Relu,
    Tanh,
    /// `alpha * x + beta`.
    Linear,
    /// `1 / (1 + exp(-x))`.
    Logistic,
}

impl EltwiseAlg {
    /// `Relu` uses `alpha` as the negative slope.
    #[inline]
    pub fn apply(self, x: f32, alpha: f32, beta: f32) -> f32 {
        match self {
            EltwiseAlg::Relu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            EltwiseAlg::Tanh => x.tanh(),
            EltwiseAlg::Linear => alpha * x + beta,
            EltwiseAlg::Logistic => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostOp {
    /// Accumulate onto the previous destination contents, scaled.
    Sum { scale: f32 },
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOps(SmallVec<[PostOp; 4]>);

impl PostOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_sum(&mut self, scale: f32) {
        self.0.push(PostOp::Sum { scale });
    }

    pub fn append_eltwise(&mut self, alg: EltwiseAlg, alpha: f32, beta: f32) {
        self.0.push(PostOp::Eltwise { alg, alpha, beta });
    }

    pub fn ops(&self) -> &[PostOp] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Who owns the scratchpad memory passed to `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScratchpadMode {
    /// The primitive allocates one at creation and uses it for calls that provide none.
    #[default]
    Library,
    /// The caller must always provide it.
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveAttr {
    output_scale: f32,
    post_ops: PostOps,
    scratchpad_mode: ScratchpadMode,
}

impl Default for PrimitiveAttr {
    fn default() -> Self {
        Self {
            output_scale: 1.0,
            post_ops: PostOps::new(),
            scratchpad_mode: ScratchpadMode::Library,
        }
    }
}

impl PrimitiveAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_scale(mut self, scale: f32) -> Self {
        self.output_scale = scale;
        self
    }

    pub fn with_post_ops(mut self, post_ops: PostOps) -> Self {
        self.post_ops = post_ops;
        self
    }

    pub fn with_scratchpad_mode(mut self, mode: ScratchpadMode) -> Self {
        self.scratchpad_mode = mode;
        self
    }

    pub fn output_scale(&self) -> f32 {
        self.output_scale
    }

    pub fn post_ops(&self) -> &PostOps {
        &self.post_ops
    }

    pub fn scratchpad_mode(&self) -> ScratchpadMode {
        self.scratchpad_mode
    }

    /// True when nothing changes the arithmetic of a plain convolution. The scratchpad mode
    /// does not count.
    pub fn has_default_values(&self) -> bool {
        self.output_scale == 1.0 && self.post_ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eltwise_kernels() {
        assert_eq!(EltwiseAlg::Relu.apply(-2.0, 0.5, 0.0), -1.0);
        assert_eq!(EltwiseAlg::Relu.apply(3.0, 0.0, 0.0), 3.0);
        assert_eq!(EltwiseAlg::Linear.apply(2.0, 3.0, 1.0), 7.0);
        assert!((EltwiseAlg::Logistic.apply(0.0, 0.0, 0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn scratchpad_mode_does_not_affect_default_values() {
        let attr = PrimitiveAttr::new().with_scratchpad_mode(ScratchpadMode::User);
        assert!(attr.has_default_values());
        assert!(!attr.clone().with_output_scale(0.5).has_default_values());

        let mut post_ops = PostOps::new();
        post_ops.append_sum(1.0);
        assert!(!attr.with_post_ops(post_ops).has_default_values());
    }
}
