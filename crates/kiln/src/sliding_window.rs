//! Sliding-window output-range calculators.
//!
//! Convolution, pooling and deconvolution all reduce to the same per-axis
//! integer relation between input extent, filter extent, padding, stride and
//! dilation. All arithmetic is exact and each spatial axis is computed
//! independently. Padding may be negative.

/// Rounding behavior at the right edge of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SworMode {
    /// Standard floor division: every window lies fully inside the padded input.
    All,
    /// Pooling-style ceil division: the last window may overrun the data by at
    /// most one stride, provided it still starts inside the data.
    ExceedOnceData,
}

/// Effective filter extent after dilation.
fn extended_filter(filter: i64, dilation: i64) -> i64 {
    (filter - 1) * dilation + 1
}

fn ceil_div(num: i64, den: i64) -> i64 {
    debug_assert!(den > 0);
    num.div_euclid(den) + if num.rem_euclid(den) != 0 { 1 } else { 0 }
}

/// Output extent of a sliding-window operation, per spatial axis.
pub fn output_range(
    mode: SworMode,
    input: [i64; 3],
    filter: [i64; 3],
    pad: [i64; 3],
    stride: [i64; 3],
    dilation: [i64; 3],
) -> [i64; 3] {
    let mut out = [1i64; 3];
    for axis in 0..3 {
        let ext = extended_filter(filter[axis], dilation[axis]);
        let num = input[axis] + 2 * pad[axis] - ext;
        out[axis] = match mode {
            SworMode::All => num.div_euclid(stride[axis]) + 1,
            SworMode::ExceedOnceData => {
                let mut o = ceil_div(num, stride[axis]) + 1;
                // The extra window must still start inside the data + lower pad.
                if (o - 1) * stride[axis] >= input[axis] + pad[axis] {
                    o -= 1;
                }
                o
            }
        }
        .max(0);
    }
    out
}

/// Minimal input extent whose transposed sliding window covers the requested
/// output, per spatial axis. This inverts [`output_range`] with ceil
/// tie-breaking: the produced output may exceed the requested one, the caller
/// trims via padding.
pub fn needed_input_range(
    output: [i64; 3],
    filter: [i64; 3],
    pad: [i64; 3],
    stride: [i64; 3],
) -> [i64; 3] {
    let mut needed = [1i64; 3];
    for axis in 0..3 {
        let ext = extended_filter(filter[axis], 1);
        let num = output[axis] + 2 * pad[axis] - ext;
        needed[axis] = (ceil_div(num, stride[axis]) + 1).max(1);
    }
    needed
}

/// Input extent actually consumed by the windows of [`output_range`], used
/// when computing how much upper padding a consumer requires.
pub fn consumed_input_range(
    output: [i64; 3],
    filter: [i64; 3],
    stride: [i64; 3],
    dilation: [i64; 3],
) -> [i64; 3] {
    let mut consumed = [0i64; 3];
    for axis in 0..3 {
        let ext = extended_filter(filter[axis], dilation[axis]);
        consumed[axis] = (output[axis] - 1) * stride[axis] + ext;
    }
    consumed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_stride_conv() {
        let out = output_range(
            SworMode::All,
            [7, 7, 1],
            [3, 3, 1],
            [0, 0, 0],
            [1, 1, 1],
            [1, 1, 1],
        );
        assert_eq!(out, [5, 5, 1]);
    }

    #[test]
    fn strided_padded_conv() {
        let out = output_range(
            SworMode::All,
            [7, 7, 1],
            [3, 3, 1],
            [1, 1, 0],
            [2, 2, 1],
            [1, 1, 1],
        );
        assert_eq!(out, [4, 4, 1]);
    }

    #[test]
    fn pooling_overruns_at_most_once() {
        let out = output_range(
            SworMode::ExceedOnceData,
            [7, 7, 1],
            [2, 2, 1],
            [0, 0, 0],
            [2, 2, 1],
            [1, 1, 1],
        );
        assert_eq!(out, [4, 4, 1]);
        // The fourth window starts at 6, inside the data, and overruns by one.
        assert!((out[0] - 1) * 2 < 7);
    }

    #[test]
    fn pooling_clamp_keeps_window_start_inside_data() {
        let out = output_range(
            SworMode::ExceedOnceData,
            [4, 4, 1],
            [2, 2, 1],
            [1, 1, 0],
            [2, 2, 1],
            [1, 1, 1],
        );
        // ceil((4 + 2 - 2) / 2) + 1 = 3; window 2 starts at 4 - pad 1 = 3, kept.
        assert_eq!(out, [3, 3, 1]);
    }

    #[test]
    fn deconv_needed_input() {
        let needed = needed_input_range([8, 8, 1], [3, 3, 1], [0, 0, 0], [2, 2, 1]);
        assert_eq!(needed, [4, 4, 1]);
    }

    #[test]
    fn dilation_extends_filter() {
        // dilation 2 turns a 3-tap filter into an effective 5-tap one
        let out = output_range(
            SworMode::All,
            [9, 9, 1],
            [3, 3, 1],
            [0, 0, 0],
            [1, 1, 1],
            [2, 2, 1],
        );
        assert_eq!(out, [5, 5, 1]);
    }
}
