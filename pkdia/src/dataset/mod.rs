//! 推理用切片采样.
//!
//! 将 3D 体数据沿采样轴逐层展开为网络输入. 推理时 batch 恒为 1,
//! 因此不设数据加载器抽象, 由调用方以普通循环逐个索引取切片即可.

use std::path::Path;

use image::ImageResult;
use ndarray::Array2;

use crate::consts::{PERCENTILE_HIGH, PERCENTILE_LOW};
use crate::data::{normalize, KidneyVolume};
use crate::transform;

/// 提取沿采样轴第 `idx` 层的网络输入切片 (8-bit 灰度).
///
/// 流程: 取 `(X, Z)` 截面 -> 反转第一轴 (镜像) -> 双线性重采样到
/// `size x size` -> 逆时针旋转 90 度 -> 按 1%/99% 百分位拉伸对比度到
/// `[0, 1]` (区间外截断) -> 量化为 8-bit.
///
/// 两段式灰度规范化 (百分位截断 + 8-bit 量化) 用于在 mean/std
/// 规范化之前抑制医学影像中常见的离群体素强度.
///
/// 对相同的 `(volume, idx, size)` 输入, 输出逐位相同.
///
/// 当 `idx` 越界或 `size` 为 0 时 panic.
pub fn extract_slice(vol: &KidneyVolume, idx: usize, size: usize) -> Array2<u8> {
    let section = vol.cross_section(idx);
    let mirrored = transform::flip_rows(section);
    let resized = transform::resize_bilinear(mirrored.view(), (size, size));
    let rotated = transform::rot90_ccw(resized.view());

    let lo = transform::percentile(rotated.view(), PERCENTILE_LOW);
    let hi = transform::percentile(rotated.view(), PERCENTILE_HIGH);
    let stretched = transform::rescale_unit(rotated.view(), lo, hi);
    transform::as_ubyte(stretched.view())
}

/// 提取第 `idx` 层并做网络侧 mean/std 规范化, 得到 `f32` 网络输入.
///
/// 切片此前已被拉伸到 `[0, 1]` 再量化, 这里的第二次规范化
/// 以该切片自身的统计量重新定心.
pub fn network_input(vol: &KidneyVolume, idx: usize, size: usize) -> Array2<f32> {
    let mut img = extract_slice(vol, idx, size).mapv(|v| v as f32);
    normalize(img.view_mut());
    img
}

/// 将提取出的 8-bit 切片按原样保存为灰度图, 便于人工检查网络输入.
pub fn save_slice_preview<P: AsRef<Path>>(slice: &Array2<u8>, path: P) -> ImageResult<()> {
    let (height, width) = slice.dim();
    let mut buf = image::GrayImage::new(width as u32, height as u32);
    for ((h, w), &pix) in slice.indexed_iter() {
        buf.put_pixel(w as u32, h as u32, image::Luma([pix]));
    }
    buf.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Modality;
    use ndarray::Array3;
    use nifti::writer::WriterOptions;
    use nifti::NiftiHeader;

    fn test_volume() -> KidneyVolume {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.nii");
        let data = Array3::from_shape_fn((8, 4, 8), |(i, j, k)| (i * 37 + j * 11 + k * 3) as f32);

        let mut h = NiftiHeader::default();
        h.sform_code = 1;
        h.srow_x = [1.0, 0.0, 0.0, 0.0];
        h.srow_y = [0.0, 1.0, 0.0, 0.0];
        h.srow_z = [0.0, 0.0, 1.0, 0.0];
        h.pixdim = [1.0; 8];
        WriterOptions::new(&path)
            .reference_header(&h)
            .write_nifti(&data)
            .unwrap();
        KidneyVolume::open(&path, Modality::T2).unwrap()
    }

    #[test]
    fn test_extract_shape_and_determinism() {
        let vol = test_volume();
        let a = extract_slice(&vol, 1, 16);
        let b = extract_slice(&vol, 1, 16);
        assert_eq!(a.dim(), (16, 16));
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_value_range() {
        let vol = test_volume();
        let s = extract_slice(&vol, 2, 32);
        // 百分位拉伸后必然同时出现下截断与上截断的像素.
        assert!(s.iter().any(|&v| v == 0));
        assert!(s.iter().any(|&v| v == 255));
    }

    #[test]
    fn test_network_input_centered() {
        let vol = test_volume();
        let img = network_input(&vol, 0, 16);
        let mean = img.mean().unwrap();
        let std = img.std(0.0);
        assert!(mean.abs() < 1e-4);
        assert!((std - 1.0).abs() < 1e-4);
    }
}
