//! 体素轴向规范化.
//!
//! 将任意存储顺序的 3D 体数据重排到最接近的规范轴序 (RAS+):
//! 体素轴 0/1/2 分别沿物理 X/Y/Z 正方向增长.
//! 重排同时作用于体素数组与 affine, 保证两者始终一致.

use ndarray::{Array3, Axis};

use super::affine::Affine;

/// 每个体素轴的 (主导物理轴, 方向符号).
type AxisDirections = [(usize, f64); 3];

/// 求每个体素轴 (affine 的列) 主导的物理轴与方向.
///
/// 依次处理三个列, 每列在尚未被占用的物理轴中取绝对值最大的分量.
/// 退化列 (全零) 落到第一个空闲物理轴上, 方向取正.
fn axis_directions(aff: &Affine) -> AxisDirections {
    let mut taken = [false; 3];
    let mut ans: AxisDirections = [(0, 1.0); 3];

    for col in 0..3 {
        let mut best: Option<(usize, f64)> = None;
        for row in 0..3 {
            if taken[row] {
                continue;
            }
            let v = aff[(row, col)];
            match best {
                Some((_, b)) if v.abs() <= b.abs() => {}
                _ => best = Some((row, v)),
            }
        }
        // 三个列至多占用三个物理轴, 这里必然非空.
        let (row, v) = best.unwrap();
        taken[row] = true;
        ans[col] = (row, if v < 0.0 { -1.0 } else { 1.0 });
    }
    ans
}

/// 将 `(data, affine)` 重排到最接近的规范轴序.
///
/// 先翻转方向为负的体素轴, 再按主导物理轴重排三个体素轴.
/// 两步都同步更新 affine: 翻转轴 `j` 时平移分量加上 `col_j * (n_j - 1)`
/// 且列取反; 重排时交换对应的空间列. 返回标准布局的数组.
pub fn to_canonical(data: Array3<f32>, affine: Affine) -> (Array3<f32>, Affine) {
    let mut data = data;
    let mut aff = affine;
    let dirs = axis_directions(&aff);

    // 1. 翻转负方向轴.
    for (j, &(_, sign)) in dirs.iter().enumerate() {
        if sign >= 0.0 {
            continue;
        }
        let n = data.len_of(Axis(j));
        data.invert_axis(Axis(j));
        for row in 0..3 {
            let c = aff[(row, j)];
            aff[(row, 3)] += c * (n as f64 - 1.0);
            aff[(row, j)] = -c;
        }
    }

    // 2. 重排轴: 物理轴 i 对应的体素轴移动到位置 i.
    let mut perm = [0usize; 3];
    for (j, &(world, _)) in dirs.iter().enumerate() {
        perm[world] = j;
    }
    if perm != [0, 1, 2] {
        data = data.permuted_axes(perm);
        let old = aff.clone();
        for (i, &j) in perm.iter().enumerate() {
            for row in 0..3 {
                aff[(row, i)] = old[(row, j)];
            }
        }
    }

    let data = data.as_standard_layout().to_owned();
    (data, aff)
}

/// 交换第二/第三空间轴 (体素与 affine 的空间列同步交换).
///
/// 用于修正 CT 采集与 MRI 采集之间系统性的轴向差异, 仅在载入时调用一次.
pub fn swap_axes_1_2(data: Array3<f32>, affine: Affine) -> (Array3<f32>, Affine) {
    let data = data.permuted_axes([0, 2, 1]).as_standard_layout().to_owned();
    let mut aff = affine;
    for row in 0..4 {
        let tmp = aff[(row, 1)];
        aff[(row, 1)] = aff[(row, 2)];
        aff[(row, 2)] = tmp;
    }
    (data, aff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn diag(x: f64, y: f64, z: f64) -> Affine {
        let mut a = Affine::eye(4);
        a[(0, 0)] = x;
        a[(1, 1)] = y;
        a[(2, 2)] = z;
        a
    }

    #[test]
    fn test_already_canonical_is_identity() {
        let data = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        let aff = diag(1.0, 1.5, 2.0);
        let (out, a) = to_canonical(data.clone(), aff.clone());
        assert_eq!(out, data);
        assert_eq!(a, aff);
    }

    #[test]
    fn test_flip_single_axis() {
        // 体素轴 0 沿物理 X 负方向.
        let data = Array3::from_shape_fn((3, 2, 2), |(i, _, _)| i as f32);
        let mut aff = diag(-2.0, 1.0, 1.0);
        aff[(0, 3)] = 10.0;

        let (out, a) = to_canonical(data, aff);
        // 翻转后体素值次序反转
        assert_eq!(out[(0, 0, 0)], 2.0);
        assert_eq!(out[(2, 0, 0)], 0.0);
        // affine 方向转正, 平移补偿 (3 - 1) * -2 = -4
        assert_eq!(a[(0, 0)], 2.0);
        assert_eq!(a[(0, 3)], 6.0);
    }

    #[test]
    fn test_permuted_axes() {
        // 体素轴 0 -> 物理 Z, 轴 1 -> 物理 X, 轴 2 -> 物理 Y.
        let data = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        let mut aff = Affine::eye(4);
        aff[(0, 0)] = 0.0;
        aff[(1, 1)] = 0.0;
        aff[(2, 2)] = 0.0;
        aff[(2, 0)] = 3.0; // 列 0 -> Z
        aff[(0, 1)] = 1.0; // 列 1 -> X
        aff[(1, 2)] = 2.0; // 列 2 -> Y

        let (out, a) = to_canonical(data, aff);
        assert_eq!(out.dim(), (3, 4, 2));
        // out[(j, k, i)] == data[(i, j, k)]
        assert_eq!(out[(1, 2, 0)], 12.0);
        assert_eq!(out[(2, 3, 1)], 123.0);
        // 重排后 affine 为正对角
        assert_eq!(a[(0, 0)], 1.0);
        assert_eq!(a[(1, 1)], 2.0);
        assert_eq!(a[(2, 2)], 3.0);
        assert_eq!(a[(2, 1)], 0.0);
    }

    #[test]
    fn test_canonical_is_idempotent() {
        let data = Array3::from_shape_fn((4, 3, 2), |(i, j, k)| (i + 2 * j + 5 * k) as f32);
        let mut aff = diag(-1.0, 2.0, 1.0);
        aff[(1, 3)] = 4.0;

        let (d1, a1) = to_canonical(data, aff);
        let (d2, a2) = to_canonical(d1.clone(), a1.clone());
        assert_eq!(d1, d2);
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_swap_axes_1_2() {
        let data = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        let mut aff = diag(1.0, 2.0, 3.0);
        aff[(1, 3)] = 8.0;

        let (out, a) = swap_axes_1_2(data, aff);
        assert_eq!(out.dim(), (2, 4, 3));
        assert_eq!(out[(1, 2, 1)], 112.0);
        assert_eq!(a[(1, 2)], 2.0);
        assert_eq!(a[(2, 1)], 3.0);
        assert_eq!(a[(1, 1)], 0.0);
        // 平移列不动
        assert_eq!(a[(1, 3)], 8.0);
    }
}
