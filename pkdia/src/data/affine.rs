//! nifti header 与 4x4 affine 矩阵之间的转换.
//!
//! affine 将体素索引 `(i, j, k, 1)` 映射到物理 (扫描仪) 坐标.
//! 读取优先级与 nifti 规范一致: sform > qform > pixdim 对角阵.

use ndarray::{Array2, ArrayView2};
use nifti::NiftiHeader;

/// 4x4 affine 矩阵类型.
pub type Affine = Array2<f64>;

/// 从 header 构建 affine.
///
/// 1. 若 `sform_code > 0`, 直接取 `srow_{x, y, z}` 三行;
/// 2. 否则若 `qform_code > 0`, 由四元数与 `pixdim` 重建;
/// 3. 否则回退为 `pixdim` 对角阵 (无平移).
pub fn from_header(h: &NiftiHeader) -> Affine {
    if h.sform_code > 0 {
        let mut a = Affine::eye(4);
        for (row, src) in [h.srow_x, h.srow_y, h.srow_z].iter().enumerate() {
            for col in 0..4 {
                a[(row, col)] = src[col] as f64;
            }
        }
        return a;
    }

    if h.qform_code > 0 {
        return from_quaternion(h);
    }

    let mut a = Affine::eye(4);
    for i in 0..3 {
        let d = h.pixdim[i + 1] as f64;
        a[(i, i)] = if d != 0.0 { d } else { 1.0 };
    }
    a
}

/// 由 header 的四元数部分重建 affine (nifti "method 2").
fn from_quaternion(h: &NiftiHeader) -> Affine {
    let (b, c, d) = (
        h.quatern_b as f64,
        h.quatern_c as f64,
        h.quatern_d as f64,
    );
    let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();

    // 行优先的旋转矩阵.
    let r = [
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
        ],
        [
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
        ],
        [
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - b * b - c * c,
        ],
    ];

    // qfac 只影响第三列方向.
    let qfac = if (h.pixdim[0] as f64) < 0.0 { -1.0 } else { 1.0 };
    let scale = [
        h.pixdim[1].abs() as f64,
        h.pixdim[2].abs() as f64,
        qfac * h.pixdim[3].abs() as f64,
    ];
    let offset = [h.quatern_x as f64, h.quatern_y as f64, h.quatern_z as f64];

    let mut aff = Affine::eye(4);
    for row in 0..3 {
        for col in 0..3 {
            aff[(row, col)] = r[row][col] * scale[col];
        }
        aff[(row, 3)] = offset[row];
    }
    aff
}

/// 将 affine 回写到 header 的 sform 部分, 并同步 `pixdim` 为各列的模长.
///
/// 如果 `aff` 不是 4x4 矩阵, 则 panic.
pub fn write_to_header(h: &mut NiftiHeader, aff: ArrayView2<f64>) {
    assert_eq!(aff.dim(), (4, 4), "affine 必须是 4x4 矩阵");

    if h.sform_code <= 0 {
        h.sform_code = 1;
    }
    for col in 0..4 {
        h.srow_x[col] = aff[(0, col)] as f32;
        h.srow_y[col] = aff[(1, col)] as f32;
        h.srow_z[col] = aff[(2, col)] as f32;
    }
    for i in 0..3 {
        let norm = (0..3)
            .map(|row| aff[(row, i)] * aff[(row, i)])
            .sum::<f64>()
            .sqrt();
        h.pixdim[i + 1] = norm as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sform_priority() {
        let mut h = NiftiHeader::default();
        h.sform_code = 1;
        h.srow_x = [0.0, 0.0, 2.0, 10.0];
        h.srow_y = [3.0, 0.0, 0.0, 20.0];
        h.srow_z = [0.0, 4.0, 0.0, 30.0];

        let a = from_header(&h);
        assert_eq!(a[(0, 2)], 2.0);
        assert_eq!(a[(1, 0)], 3.0);
        assert_eq!(a[(2, 1)], 4.0);
        assert_eq!(a[(0, 3)], 10.0);
        assert_eq!(a[(3, 3)], 1.0);
    }

    #[test]
    fn test_pixdim_fallback() {
        let mut h = NiftiHeader::default();
        h.sform_code = 0;
        h.qform_code = 0;
        h.pixdim = [1.0, 0.5, 0.75, 2.0, 0.0, 0.0, 0.0, 0.0];

        let a = from_header(&h);
        assert_eq!(a[(0, 0)], 0.5);
        assert_eq!(a[(1, 1)], 0.75);
        assert_eq!(a[(2, 2)], 2.0);
        assert_eq!(a[(0, 3)], 0.0);
    }

    #[test]
    fn test_identity_quaternion() {
        let mut h = NiftiHeader::default();
        h.sform_code = 0;
        h.qform_code = 1;
        h.quatern_b = 0.0;
        h.quatern_c = 0.0;
        h.quatern_d = 0.0;
        h.pixdim = [1.0, 1.5, 2.0, 2.5, 0.0, 0.0, 0.0, 0.0];
        h.quatern_x = -7.0;

        let a = from_header(&h);
        assert!((a[(0, 0)] - 1.5).abs() < 1e-9);
        assert!((a[(1, 1)] - 2.0).abs() < 1e-9);
        assert!((a[(2, 2)] - 2.5).abs() < 1e-9);
        assert!((a[(0, 3)] + 7.0).abs() < 1e-9);
        assert_eq!(a[(1, 0)], 0.0);
    }

    #[test]
    fn test_write_back_round_trip() {
        let mut h = NiftiHeader::default();
        h.sform_code = 1;
        h.srow_x = [2.0, 0.0, 0.0, 5.0];
        h.srow_y = [0.0, 0.0, -3.0, 6.0];
        h.srow_z = [0.0, 1.0, 0.0, 7.0];

        let a = from_header(&h);
        let mut h2 = NiftiHeader::default();
        write_to_header(&mut h2, a.view());
        let b = from_header(&h2);
        assert_eq!(a, b);
        // pixdim 同步为列模长
        assert!((h2.pixdim[1] - 2.0).abs() < 1e-6);
        assert!((h2.pixdim[2] - 1.0).abs() < 1e-6);
        assert!((h2.pixdim[3] - 3.0).abs() < 1e-6);
    }
}
