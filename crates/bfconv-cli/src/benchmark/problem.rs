//! Problem strings in the form printed by `ConvDesc::problem_string`, e.g.
//! `mb2ic20oc32_iw10ow8kw3sw1dw1pw0`.
//!
//! Keys may appear in any order and `_` separators are optional. Spatial keys end in `d`,
//! `h` or `w`; the outermost axis mentioned fixes the rank. Missing values default to
//! `mb=2`, `g=1`, kernel/stride/dilation 1 and padding 0. Without an output extent the right
//! padding mirrors the left one and the output is derived; with one, the right padding is
//! whatever makes the output come out as given. Dilation 1 is a dense kernel.

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvShape {
    pub mb: usize,
    pub groups: usize,
    pub ic: usize,
    pub oc: usize,
    /// Spatial extents outermost first; every vector has one entry per spatial axis.
    pub input: Vec<usize>,
    pub output: Vec<usize>,
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilation: Vec<usize>,
    pub pad_l: Vec<usize>,
    pub pad_r: Vec<usize>,
}

const AXES: [char; 3] = ['d', 'h', 'w'];

#[derive(Default)]
struct Axis {
    input: Option<usize>,
    output: Option<usize>,
    kernel: Option<usize>,
    stride: Option<usize>,
    dilation: Option<usize>,
    padding: Option<usize>,
}

fn tokens(text: &str) -> Result<Vec<(String, usize)>> {
    let mut out = Vec::new();
    let mut chars = text.chars().filter(|c| *c != '_').peekable();
    while chars.peek().is_some() {
        let key: String = std::iter::from_fn(|| chars.next_if(|c| c.is_ascii_alphabetic())).collect();
        let digits: String = std::iter::from_fn(|| chars.next_if(|c| c.is_ascii_digit())).collect();
        if key.is_empty() {
            bail!("expected a key before '{digits}' in '{text}'");
        }
        if digits.is_empty() {
            bail!("key '{key}' has no value in '{text}'");
        }
        let value = digits
            .parse()
            .with_context(|| format!("value of '{key}' in '{text}'"))?;
        out.push((key, value));
    }
    Ok(out)
}

fn spatial_slot<'a>(axes: &'a mut [Axis; 3], key: &str) -> Option<(&'a mut Option<usize>, usize)> {
    let mut chars = key.chars();
    let (kind, axis) = (chars.next()?, chars.next()?);
    if chars.next().is_some() {
        return None;
    }
    let index = AXES.iter().position(|&a| a == axis)?;
    let slot = &mut axes[index];
    let field = match kind {
        'i' => &mut slot.input,
        'o' => &mut slot.output,
        'k' => &mut slot.kernel,
        's' => &mut slot.stride,
        'd' => &mut slot.dilation,
        'p' => &mut slot.padding,
        _ => return None,
    };
    Some((field, index))
}

impl ConvShape {
    pub fn parse(text: &str) -> Result<Self> {
        let mut mb = None;
        let mut groups = None;
        let mut ic = None;
        let mut oc = None;
        let mut axes: [Axis; 3] = Default::default();
        let mut outermost = None::<usize>;

        for (key, value) in tokens(text)? {
            let slot = match key.as_str() {
                "mb" => &mut mb,
                "g" => &mut groups,
                "ic" => &mut ic,
                "oc" => &mut oc,
                other => {
                    let (field, index) = spatial_slot(&mut axes, other)
                        .with_context(|| format!("unknown key '{other}' in '{text}'"))?;
                    outermost = Some(outermost.map_or(index, |d: usize| d.min(index)));
                    field
                }
            };
            if slot.replace(value).is_some() {
                bail!("key '{key}' given twice in '{text}'");
            }
        }

        let ic = ic.with_context(|| format!("'{text}' is missing ic"))?;
        let oc = oc.with_context(|| format!("'{text}' is missing oc"))?;
        let first_axis = outermost.with_context(|| format!("'{text}' has no spatial dimension"))?;

        let mut shape = ConvShape {
            mb: mb.unwrap_or(2),
            groups: groups.unwrap_or(1),
            ic,
            oc,
            input: Vec::new(),
            output: Vec::new(),
            kernel: Vec::new(),
            strides: Vec::new(),
            dilation: Vec::new(),
            pad_l: Vec::new(),
            pad_r: Vec::new(),
        };
        if shape.groups == 0 || ic % shape.groups != 0 || oc % shape.groups != 0 {
            bail!("channels ic{ic} oc{oc} do not split into {} groups", shape.groups);
        }
        for (axis, name) in axes.iter().zip(AXES).skip(first_axis) {
            let input = axis
                .input
                .with_context(|| format!("'{text}' is missing i{name}"))?;
            let kernel = axis.kernel.unwrap_or(1);
            let stride = axis.stride.unwrap_or(1);
            let dilation = axis.dilation.unwrap_or(1);
            let pad_l = axis.padding.unwrap_or(0);
            if stride == 0 || dilation == 0 {
                bail!("s{name} and d{name} must be positive in '{text}'");
            }
            let extent = kernel.saturating_sub(1) * dilation + 1;
            let padded = input + 2 * pad_l;
            let symmetric = (padded >= extent).then(|| (padded - extent) / stride + 1);
            let (output, pad_r) = match (axis.output, symmetric) {
                (Some(0), _) => bail!("o{name} must be positive in '{text}'"),
                (None, Some(output)) => (output, pad_l),
                (None, None) => bail!("k{name}{kernel} does not fit i{name}{input} in '{text}'"),
                (Some(given), Some(output)) if given == output => (output, pad_l),
                (Some(given), _) => {
                    let needed = (given - 1) * stride + extent;
                    let pad_r = needed.checked_sub(input + pad_l).with_context(|| {
                        format!("o{name}{given} needs negative right padding in '{text}'")
                    })?;
                    (given, pad_r)
                }
            };
            shape.input.push(input);
            shape.output.push(output);
            shape.kernel.push(kernel);
            shape.strides.push(stride);
            shape.dilation.push(dilation);
            shape.pad_l.push(pad_l);
            shape.pad_r.push(pad_r);
        }
        Ok(shape)
    }

    /// Multiply-adds of one forward (or backward-data) pass, times two.
    pub fn flops(&self) -> f64 {
        let output: usize = self.output.iter().product();
        let kernel: usize = self.kernel.iter().product();
        2.0 * (self.mb * self.oc * (self.ic / self.groups) * output * kernel) as f64
    }
}
