use half::bf16;

/// Destination element the kernels can store; arithmetic is always f32.
pub trait Element: Copy + Send + Sync {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    /// Rounds to nearest even.
    #[inline]
    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}
