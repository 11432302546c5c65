//! Tensor metadata: data types, dimensions, formats, padding and layouts.
//!
//! A [`Layout`] is the physical interpretation of a node's output buffer:
//! (data type, format, shape, padding). Formats encode the logical axis
//! order together with the physical blocking scheme, e.g.
//! [`Format::BFsYxFsv16`] stores features in blocks of 16.

use serde::{Deserialize, Serialize};

/// Scalar element types understood by the compiler core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
    I8,
    /// Single-bit type used by binary convolutions.
    I1,
}

impl DType {
    /// Storage width in bits.
    pub fn bitwidth(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 32,
            DType::F16 => 16,
            DType::I64 => 64,
            DType::U8 | DType::I8 => 8,
            DType::I1 => 1,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        (self.bitwidth() + 7) / 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }

    /// Quantized 8-bit integer types.
    pub fn is_quantized(self) -> bool {
        matches!(self, DType::U8 | DType::I8)
    }

    fn rank(self) -> u8 {
        match self {
            DType::F32 => 7,
            DType::F16 => 6,
            DType::I64 => 5,
            DType::I32 => 4,
            DType::U8 => 3,
            DType::I8 => 2,
            DType::I1 => 1,
        }
    }

    /// Joins two types on the precision lattice: f32 > f16 > i64 > i32 > u8 > i8 > i1.
    /// A float always wins against a quantized type.
    pub fn max_type(a: DType, b: DType) -> DType {
        if a == b {
            return a;
        }
        if a.is_float() && b.is_quantized() {
            return a;
        }
        if b.is_float() && a.is_quantized() {
            return b;
        }
        if a.rank() >= b.rank() {
            a
        } else {
            b
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::I1 => "i1",
        }
    }
}

/// Logical axes of a tensor. Spatial axes are named x/y/z, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Batch,
    Feature,
    X,
    Y,
    Z,
}

/// Tensor extents in the canonical batch/feature/spatial decomposition.
///
/// `spatial[0]` is x (innermost), `spatial[1]` is y, `spatial[2]` is z.
/// Extents are signed so padding arithmetic with negative extents stays in
/// one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDims {
    pub batch: i64,
    pub feature: i64,
    pub spatial: [i64; 3],
}

impl TensorDims {
    pub const fn new(batch: i64, feature: i64, spatial: [i64; 3]) -> Self {
        Self {
            batch,
            feature,
            spatial,
        }
    }

    /// 4-d helper in the usual b, f, y, x reading order.
    pub const fn bfyx(b: i64, f: i64, y: i64, x: i64) -> Self {
        Self::new(b, f, [x, y, 1])
    }

    pub const fn zero() -> Self {
        Self::new(0, 0, [0, 0, 0])
    }

    pub const fn ones() -> Self {
        Self::new(1, 1, [1, 1, 1])
    }

    pub fn count(&self) -> i64 {
        self.batch * self.feature * self.spatial[0] * self.spatial[1] * self.spatial[2]
    }

    pub fn axis(&self, axis: Axis) -> i64 {
        match axis {
            Axis::Batch => self.batch,
            Axis::Feature => self.feature,
            Axis::X => self.spatial[0],
            Axis::Y => self.spatial[1],
            Axis::Z => self.spatial[2],
        }
    }

    pub fn set_axis(&mut self, axis: Axis, value: i64) {
        match axis {
            Axis::Batch => self.batch = value,
            Axis::Feature => self.feature = value,
            Axis::X => self.spatial[0] = value,
            Axis::Y => self.spatial[1] = value,
            Axis::Z => self.spatial[2] = value,
        }
    }

    pub fn add(&self, other: &TensorDims) -> TensorDims {
        TensorDims::new(
            self.batch + other.batch,
            self.feature + other.feature,
            [
                self.spatial[0] + other.spatial[0],
                self.spatial[1] + other.spatial[1],
                self.spatial[2] + other.spatial[2],
            ],
        )
    }

    pub fn max(a: &TensorDims, b: &TensorDims) -> TensorDims {
        TensorDims::new(
            a.batch.max(b.batch),
            a.feature.max(b.feature),
            [
                a.spatial[0].max(b.spatial[0]),
                a.spatial[1].max(b.spatial[1]),
                a.spatial[2].max(b.spatial[2]),
            ],
        )
    }
}

/// Tensor memory formats: logical axis order plus physical blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    /// Wildcard used in preferred-format queries; never a concrete buffer format.
    Any,
    Bfyx,
    Yxfb,
    Byxf,
    Bfzyx,
    BFsYxFsv16,
    BFsYxFsv32,
    BFsZyxFsv16,
    BFsZyxFsv32,
    FsBYxFsv32,
    BsFsYxBsv16Fsv16,
}

impl Format {
    /// Feature-axis block size for blocked formats.
    pub fn feature_block(self) -> Option<i64> {
        match self {
            Format::BFsYxFsv16 | Format::BFsZyxFsv16 | Format::BsFsYxBsv16Fsv16 => Some(16),
            Format::BFsYxFsv32 | Format::BFsZyxFsv32 | Format::FsBYxFsv32 => Some(32),
            _ => None,
        }
    }

    /// Batch-axis block size for double-blocked formats.
    pub fn batch_block(self) -> Option<i64> {
        match self {
            Format::BsFsYxBsv16Fsv16 => Some(16),
            _ => None,
        }
    }

    pub fn is_blocked(self) -> bool {
        self.feature_block().is_some() || self.batch_block().is_some()
    }

    pub fn is_plain(self) -> bool {
        matches!(self, Format::Bfyx | Format::Yxfb | Format::Byxf | Format::Bfzyx)
    }

    /// Number of spatial axes addressed by the format.
    pub fn spatial_rank(self) -> usize {
        match self {
            Format::Bfzyx | Format::BFsZyxFsv16 | Format::BFsZyxFsv32 => 3,
            _ => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Any => "any",
            Format::Bfyx => "bfyx",
            Format::Yxfb => "yxfb",
            Format::Byxf => "byxf",
            Format::Bfzyx => "bfzyx",
            Format::BFsYxFsv16 => "b_fs_yx_fsv16",
            Format::BFsYxFsv32 => "b_fs_yx_fsv32",
            Format::BFsZyxFsv16 => "b_fs_zyx_fsv16",
            Format::BFsZyxFsv32 => "b_fs_zyx_fsv32",
            Format::FsBYxFsv32 => "fs_b_yx_fsv32",
            Format::BsFsYxBsv16Fsv16 => "bs_fs_yx_bsv16_fsv16",
        }
    }
}

/// Additive per-axis lower/upper extents surrounding the logical tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Padding {
    pub lower: TensorDims,
    pub upper: TensorDims,
}

impl Padding {
    pub const fn zero() -> Self {
        Self {
            lower: TensorDims::zero(),
            upper: TensorDims::zero(),
        }
    }

    pub fn new(lower: TensorDims, upper: TensorDims) -> Self {
        Self { lower, upper }
    }

    /// Symmetric spatial padding, the common convolution case.
    pub fn spatial(pad: [i64; 3]) -> Self {
        let d = TensorDims::new(0, 0, pad);
        Self { lower: d, upper: d }
    }

    pub fn is_zero(&self) -> bool {
        self.lower == TensorDims::zero() && self.upper == TensorDims::zero()
    }

    /// Elementwise maximum. Monotone and idempotent, so paddings merge in any order.
    pub fn max(a: &Padding, b: &Padding) -> Padding {
        Padding {
            lower: TensorDims::max(&a.lower, &b.lower),
            upper: TensorDims::max(&a.upper, &b.upper),
        }
    }
}

impl Default for Padding {
    fn default() -> Self {
        Padding::zero()
    }
}

/// The physical interpretation of a node's output buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub data_type: DType,
    pub format: Format,
    pub size: TensorDims,
    pub padding: Padding,
}

impl Layout {
    pub fn new(data_type: DType, format: Format, size: TensorDims) -> Self {
        Self {
            data_type,
            format,
            size,
            padding: Padding::zero(),
        }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Logical extents inflated by both padding sides.
    pub fn padded_dims(&self) -> TensorDims {
        self.size.add(&self.padding.lower).add(&self.padding.upper)
    }

    pub fn count(&self) -> i64 {
        self.size.count()
    }

    /// Buffer size in bytes, accounting for blocked-format round-up and padding.
    pub fn bytes_count(&self) -> u64 {
        let padded = self.padded_dims();
        let feature = match self.format.feature_block() {
            Some(block) => round_up(padded.feature, block),
            None => padded.feature,
        };
        let batch = match self.format.batch_block() {
            Some(block) => round_up(padded.batch, block),
            None => padded.batch,
        };
        let count =
            (batch * feature * padded.spatial[0] * padded.spatial[1] * padded.spatial[2]).max(0);
        if self.data_type == DType::I1 {
            ((count as u64) + 7) / 8
        } else {
            count as u64 * self.data_type.size_in_bytes() as u64
        }
    }

    /// Two layouts are compatible iff they address the same bytes: equal data
    /// type, equal padded extents, and the same physical ordering. Formats
    /// that differ only in logical axis order still match when at most one
    /// axis has a non-unit extent.
    pub fn compatible(&self, other: &Layout) -> bool {
        if self.data_type != other.data_type {
            return false;
        }
        if self.padded_dims() != other.padded_dims() {
            return false;
        }
        if self.format == other.format {
            return true;
        }
        if self.format.is_plain() && other.format.is_plain() && self.padding.is_zero() {
            let dims = self.size;
            let non_unit = [
                dims.batch,
                dims.feature,
                dims.spatial[0],
                dims.spatial[1],
                dims.spatial[2],
            ]
            .iter()
            .filter(|&&d| d != 1)
            .count();
            return non_unit <= 1;
        }
        false
    }

    /// Identical up to padding: the test used when deciding whether a reorder
    /// actually changes anything.
    pub fn identical(&self, other: &Layout) -> bool {
        self.data_type == other.data_type && self.format == other.format && self.size == other.size
    }
}

fn round_up(value: i64, multiple: i64) -> i64 {
    (value + multiple - 1) / multiple * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_type_prefers_float_over_quantized() {
        assert_eq!(DType::max_type(DType::F16, DType::I8), DType::F16);
        assert_eq!(DType::max_type(DType::U8, DType::F32), DType::F32);
        assert_eq!(DType::max_type(DType::I32, DType::I64), DType::I64);
        assert_eq!(DType::max_type(DType::I8, DType::I8), DType::I8);
    }

    #[test]
    fn padding_max_is_monotone_and_idempotent() {
        let a = Padding::spatial([1, 2, 0]);
        let b = Padding::spatial([2, 1, 0]);
        let m = Padding::max(&a, &b);
        assert_eq!(m.lower.spatial, [2, 2, 0]);
        assert_eq!(Padding::max(&m, &m), m);
        assert_eq!(Padding::max(&m, &a), m);
    }

    #[test]
    fn blocked_bytes_round_feature_up() {
        let l = Layout::new(DType::F16, Format::BFsYxFsv16, TensorDims::bfyx(1, 3, 8, 8));
        assert_eq!(l.bytes_count(), (16 * 8 * 8 * 2) as u64);
    }

    #[test]
    fn padded_layouts_compare_by_padded_extents() {
        let plain = Layout::new(DType::F32, Format::Bfyx, TensorDims::bfyx(1, 8, 6, 6));
        let padded = Layout::new(DType::F32, Format::Bfyx, TensorDims::bfyx(1, 8, 4, 6))
            .with_padding(Padding::spatial([0, 1, 0]));
        assert!(plain.compatible(&padded));
        assert!(!plain.identical(&padded));
    }
}
