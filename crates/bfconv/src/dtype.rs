//! Enumerates the scalar element types a convolution descriptor can name.

use std::fmt;

/// Logical dtype tag attached to every tensor of a convolution descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    /// Unspecified; never accepted by a primitive.
    #[default]
    Undef,
    /// 32-bit IEEE-754 floating point.
    F32,
    /// 16-bit bfloat16 (f32 with a truncated mantissa).
    Bf16,
    /// 16-bit IEEE-754 half precision.
    F16,
    /// 32-bit signed integer.
    S32,
    /// 8-bit signed integer.
    S8,
    /// 8-bit unsigned integer.
    U8,
}

impl DataType {
    /// Every tag, in declaration order. Handy for exhaustive whitelist checks.
    pub const ALL: [DataType; 7] = [
        DataType::Undef,
        DataType::F32,
        DataType::Bf16,
        DataType::F16,
        DataType::S32,
        DataType::S8,
        DataType::U8,
    ];

    /// Returns the number of bytes required per scalar element (zero for `Undef`).
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Undef => 0,
            DataType::F32 | DataType::S32 => 4,
            DataType::Bf16 | DataType::F16 => 2,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::Bf16 | DataType::F16)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Undef => "undef",
            DataType::F32 => "f32",
            DataType::Bf16 => "bf16",
            DataType::F16 => "f16",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" => Ok(DataType::F32),
            "bf16" => Ok(DataType::Bf16),
            "f16" => Ok(DataType::F16),
            "s32" => Ok(DataType::S32),
            "s8" => Ok(DataType::S8),
            "u8" => Ok(DataType::U8),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}
