//! 2D 几何变换与灰度变换原语.
//!
//! 这里的函数都是纯函数, 输入输出均为 `ndarray` 二维数组.
//! 90 度整数倍旋转与镜像只做索引重排, 不引入插值, 因此是精确且可逆的;
//! 只有 [`resize_bilinear`] 会插值 (保持值域, 不做抗锯齿预滤波).

use ndarray::{s, Array2, ArrayView2};
use ordered_float::OrderedFloat;

/// 反转第一轴 (上下镜像).
#[inline]
pub fn flip_rows(a: ArrayView2<f32>) -> Array2<f32> {
    a.slice(s![..;-1, ..]).to_owned()
}

/// 逆时针旋转 90 度. `(h, w)` -> `(w, h)`, `out[i][j] == a[j][w - 1 - i]`.
#[inline]
pub fn rot90_ccw(a: ArrayView2<f32>) -> Array2<f32> {
    a.t().slice(s![..;-1, ..]).to_owned()
}

/// 顺时针旋转 90 度. `(h, w)` -> `(w, h)`, `out[i][j] == a[h - 1 - j][i]`.
/// 与 [`rot90_ccw`] 互逆.
#[inline]
pub fn rot90_cw(a: ArrayView2<f32>) -> Array2<f32> {
    a.t().slice(s![.., ..;-1]).to_owned()
}

/// 双线性插值重采样到 `(out_h, out_w)`.
///
/// 采样坐标按照半像素中心对齐: `src = (dst + 0.5) * scale - 0.5`,
/// 越界处取边缘值. 输出值域不超过输入值域 (双线性插值是输入的凸组合).
///
/// 如果输入为空或目标形状存在 0 维, 则 panic.
pub fn resize_bilinear(a: ArrayView2<f32>, (out_h, out_w): (usize, usize)) -> Array2<f32> {
    let (in_h, in_w) = a.dim();
    assert!(in_h > 0 && in_w > 0, "resize_bilinear: 输入为空");
    assert!(out_h > 0 && out_w > 0, "resize_bilinear: 目标形状非法");

    if (in_h, in_w) == (out_h, out_w) {
        return a.to_owned();
    }

    let scale_h = in_h as f64 / out_h as f64;
    let scale_w = in_w as f64 / out_w as f64;

    let mut out = Array2::<f32>::zeros((out_h, out_w));
    for i in 0..out_h {
        let src_i = ((i as f64 + 0.5) * scale_h - 0.5).clamp(0.0, (in_h - 1) as f64);
        let i0 = src_i.floor() as usize;
        let i1 = (i0 + 1).min(in_h - 1);
        let di = (src_i - i0 as f64) as f32;

        for j in 0..out_w {
            let src_j = ((j as f64 + 0.5) * scale_w - 0.5).clamp(0.0, (in_w - 1) as f64);
            let j0 = src_j.floor() as usize;
            let j1 = (j0 + 1).min(in_w - 1);
            let dj = (src_j - j0 as f64) as f32;

            let top = a[(i0, j0)] * (1.0 - dj) + a[(i0, j1)] * dj;
            let bottom = a[(i1, j0)] * (1.0 - dj) + a[(i1, j1)] * dj;
            out[(i, j)] = top * (1.0 - di) + bottom * di;
        }
    }
    out
}

/// 求第 `q` 百分位数 (0 <= q <= 100). 相邻顺序统计量之间做线性插值,
/// 与常见数值库的默认行为一致.
///
/// 如果输入为空或 `q` 越界, 则 panic.
pub fn percentile(a: ArrayView2<f32>, q: f64) -> f32 {
    assert!((0.0..=100.0).contains(&q), "percentile: q 越界");
    let mut v: Vec<f32> = a.iter().copied().collect();
    assert!(!v.is_empty(), "percentile: 输入为空");

    v.sort_unstable_by_key(|x| OrderedFloat(*x));
    let pos = q / 100.0 * (v.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let frac = (pos - lo as f64) as f32;
    if frac == 0.0 || lo + 1 == v.len() {
        v[lo]
    } else {
        v[lo] + (v[lo + 1] - v[lo]) * frac
    }
}

/// 将 `[lo, hi]` 区间线性映射到 `[0, 1]`, 区间外的值截断.
/// 该映射是单调的: 输入的强度次序在输出中保持不变.
///
/// 当 `hi <= lo` 时 (平坦切片), 所有值映射为 0.
pub fn rescale_unit(a: ArrayView2<f32>, lo: f32, hi: f32) -> Array2<f32> {
    if hi <= lo {
        return Array2::zeros(a.dim());
    }
    let span = hi - lo;
    a.mapv(|x| ((x - lo) / span).clamp(0.0, 1.0))
}

/// 将 `[0, 1]` 浮点图像量化为 8-bit 灰度. `round(255 * x)`, 截断到 `[0, 255]`.
pub fn as_ubyte(a: ArrayView2<f32>) -> Array2<u8> {
    a.mapv(|x| (x * 255.0).round().clamp(0.0, 255.0) as u8)
}
