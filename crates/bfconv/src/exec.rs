//! Per-call execution context: tensor handles keyed by role plus an optional scratchpad.

use std::fmt;

use half::bf16;
use smallvec::SmallVec;

use crate::dtype::DataType;
use crate::error::{ConvError, ConvResult};
use crate::scratchpad::Scratchpad;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgRole {
    Src,
    Weights,
    Bias,
    Dst,
    DiffSrc,
    DiffDst,
}

impl ArgRole {
    pub fn name(self) -> &'static str {
        match self {
            ArgRole::Src => "src",
            ArgRole::Weights => "weights",
            ArgRole::Bias => "bias",
            ArgRole::Dst => "dst",
            ArgRole::DiffSrc => "diff_src",
            ArgRole::DiffDst => "diff_dst",
        }
    }
}

impl fmt::Display for ArgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read-only tensor buffer.
#[derive(Debug, Clone, Copy)]
pub enum TensorView<'a> {
    F32(&'a [f32]),
    Bf16(&'a [bf16]),
}

impl<'a> TensorView<'a> {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorView::F32(_) => DataType::F32,
            TensorView::Bf16(_) => DataType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorView::F32(data) => data.len(),
            TensorView::Bf16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bf16(&self) -> Option<&'a [bf16]> {
        match *self {
            TensorView::Bf16(data) => Some(data),
            TensorView::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&'a [f32]> {
        match *self {
            TensorView::F32(data) => Some(data),
            TensorView::Bf16(_) => None,
        }
    }
}

impl<'a> From<&'a [f32]> for TensorView<'a> {
    fn from(data: &'a [f32]) -> Self {
        TensorView::F32(data)
    }
}

impl<'a> From<&'a [bf16]> for TensorView<'a> {
    fn from(data: &'a [bf16]) -> Self {
        TensorView::Bf16(data)
    }
}

impl<'a> From<&'a Vec<f32>> for TensorView<'a> {
    fn from(data: &'a Vec<f32>) -> Self {
        TensorView::F32(data)
    }
}

impl<'a> From<&'a Vec<bf16>> for TensorView<'a> {
    fn from(data: &'a Vec<bf16>) -> Self {
        TensorView::Bf16(data)
    }
}

/// Writable tensor buffer.
#[derive(Debug)]
pub enum TensorViewMut<'a> {
    F32(&'a mut [f32]),
    Bf16(&'a mut [bf16]),
}

impl TensorViewMut<'_> {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorViewMut::F32(_) => DataType::F32,
            TensorViewMut::Bf16(_) => DataType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorViewMut::F32(data) => data.len(),
            TensorViewMut::Bf16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reborrow(&mut self) -> TensorViewMut<'_> {
        match self {
            TensorViewMut::F32(data) => TensorViewMut::F32(data),
            TensorViewMut::Bf16(data) => TensorViewMut::Bf16(data),
        }
    }

    pub fn as_view(&self) -> TensorView<'_> {
        match self {
            TensorViewMut::F32(data) => TensorView::F32(data),
            TensorViewMut::Bf16(data) => TensorView::Bf16(data),
        }
    }
}

impl<'a> From<&'a mut [f32]> for TensorViewMut<'a> {
    fn from(data: &'a mut [f32]) -> Self {
        TensorViewMut::F32(data)
    }
}

impl<'a> From<&'a mut [bf16]> for TensorViewMut<'a> {
    fn from(data: &'a mut [bf16]) -> Self {
        TensorViewMut::Bf16(data)
    }
}

impl<'a> From<&'a mut Vec<f32>> for TensorViewMut<'a> {
    fn from(data: &'a mut Vec<f32>) -> Self {
        TensorViewMut::F32(data)
    }
}

impl<'a> From<&'a mut Vec<bf16>> for TensorViewMut<'a> {
    fn from(data: &'a mut Vec<bf16>) -> Self {
        TensorViewMut::Bf16(data)
    }
}

/// Arguments of one `execute` call. Consumed by the call.
#[derive(Debug, Default)]
pub struct ExecCtx<'a> {
    inputs: SmallVec<[(ArgRole, TensorView<'a>); 4]>,
    outputs: SmallVec<[(ArgRole, TensorViewMut<'a>); 1]>,
    scratchpad: Option<&'a mut Scratchpad>,
}

impl<'a> ExecCtx<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a read-only argument.
    pub fn arg(mut self, role: ArgRole, view: impl Into<TensorView<'a>>) -> Self {
        let view = view.into();
        match self.inputs.iter_mut().find(|(r, _)| *r == role) {
            Some(slot) => slot.1 = view,
            None => self.inputs.push((role, view)),
        }
        self
    }

    /// Adds (or replaces) a written argument.
    pub fn arg_mut(mut self, role: ArgRole, view: impl Into<TensorViewMut<'a>>) -> Self {
        let view = view.into();
        match self.outputs.iter_mut().find(|(r, _)| *r == role) {
            Some(slot) => slot.1 = view,
            None => self.outputs.push((role, view)),
        }
        self
    }

    pub fn scratchpad(mut self, scratchpad: &'a mut Scratchpad) -> Self {
        self.scratchpad = Some(scratchpad);
        self
    }

    pub fn input(&self, role: ArgRole) -> Option<TensorView<'a>> {
        self.inputs
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, view)| *view)
    }

    pub fn has_output(&self, role: ArgRole) -> bool {
        self.outputs.iter().any(|(r, _)| *r == role)
    }

    /// Required read-only argument.
    pub fn require(&self, role: ArgRole) -> ConvResult<TensorView<'a>> {
        self.input(role)
            .ok_or_else(|| ConvError::invalid(format!("missing {role} argument")))
    }

    /// Moves a written argument out of the context.
    pub fn take_output(&mut self, role: ArgRole) -> ConvResult<TensorViewMut<'a>> {
        let index = self
            .outputs
            .iter()
            .position(|(r, _)| *r == role)
            .ok_or_else(|| ConvError::invalid(format!("missing {role} argument")))?;
        Ok(self.outputs.remove(index).1)
    }

    pub fn take_scratchpad(&mut self) -> Option<&'a mut Scratchpad> {
        self.scratchpad.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_args_replace_earlier_ones() {
        let a = [1.0f32; 4];
        let b = [2.0f32; 8];
        let ctx = ExecCtx::new().arg(ArgRole::Src, &a[..]).arg(ArgRole::Src, &b[..]);
        assert_eq!(ctx.require(ArgRole::Src).unwrap().len(), 8);
        assert!(matches!(
            ctx.require(ArgRole::Weights),
            Err(ConvError::InvalidArguments(_))
        ));
    }

    #[test]
    fn outputs_are_moved_out_once() {
        let mut dst = vec![0.0f32; 4];
        let mut ctx = ExecCtx::new().arg_mut(ArgRole::Dst, &mut dst);
        assert!(ctx.has_output(ArgRole::Dst));
        let view = ctx.take_output(ArgRole::Dst).unwrap();
        assert_eq!(view.dtype(), DataType::F32);
        assert!(ctx.take_output(ArgRole::Dst).is_err());
    }
}
