//! 推理编排: 体数据 -> 逐切片前向 -> 3D 重建 -> 后处理 -> 四个输出文件.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::{s, Array2, Array3, Axis};

use crate::consts::{suffix, PROB_THRESHOLD, RESIZE_THRESHOLD};
use crate::data::{derived_file_name, KidneyVolume, VolumeError};
use crate::dataset;
use crate::net::{default_device, DualDecoderNet, NetError, SliceModel};
use crate::post_proc;
use crate::probe::{self, ConfigError};
use crate::transform;
use crate::Modality;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 一次分割运行的统一运行时错误.
///
/// 推理对相同输入与权重是确定的, 因此任何失败都不重试,
/// 整个运行要么完成要么整体失败; 已写出的部分文件不做清理.
#[derive(Debug)]
pub enum SegmentError {
    /// 前置条件不满足 (模态/权重). 在任何计算与输出写入之前检出.
    Config(ConfigError),

    /// 体数据读写失败.
    Volume(VolumeError),

    /// 前向计算或重建失败.
    Inference(NetError),
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::Config(e) => write!(f, "配置错误: {e}"),
            SegmentError::Volume(e) => write!(f, "体数据错误: {e}"),
            SegmentError::Inference(e) => write!(f, "推理错误: {e}"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SegmentError::Config(e) => Some(e),
            SegmentError::Volume(e) => Some(e),
            SegmentError::Inference(e) => Some(e),
        }
    }
}

impl From<ConfigError> for SegmentError {
    fn from(e: ConfigError) -> Self {
        SegmentError::Config(e)
    }
}

impl From<VolumeError> for SegmentError {
    fn from(e: VolumeError) -> Self {
        SegmentError::Volume(e)
    }
}

impl From<NetError> for SegmentError {
    fn from(e: NetError) -> Self {
        SegmentError::Inference(e)
    }
}

/// 一次分割运行的四个输出文件路径.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Prediction {
    /// 左肾 mask.
    pub left_kidney: PathBuf,

    /// 右肾 mask.
    pub right_kidney: PathBuf,

    /// 左右肾合并 mask (已后处理).
    pub combined: PathBuf,

    /// 左右肾合并 mask (未后处理).
    pub combined_nopp: PathBuf,
}

/// 载入指定模态的权重并对一个体数据做完整分割.
///
/// 权重文件检查在任何计算与输出写入之前完成;
/// 设备 (加速器/CPU) 每次调用决定一次.
pub fn segment(
    input: &Path,
    output_dir: &Path,
    modality: Modality,
    weights: &Path,
) -> Result<Prediction, SegmentError> {
    let weights = probe::require_weights(modality, Some(weights))?;
    let device = default_device();
    let net = DualDecoderNet::from_weights(&weights, &device)?;
    segment_with(&net, input, output_dir, modality)
}

/// 以任意 [`SliceModel`] 实现对一个体数据做完整分割.
///
/// 算法:
///
/// 1. 载入并规范化体数据 (含轴向规范化与 CT 轴校正, 工作副本写入输出目录);
/// 2. 沿采样轴逐切片: 提取网络输入, 前向, 概率图按 0.5 二值化,
///   几何逆变换回原截面坐标系 (转置, 旋转 -90 度, 重采样,
///   以 0.95 再二值化, 反转镜像轴), 写入对应索引;
/// 3. 合并出未后处理 mask; 左右各取最大连通域后再合并;
/// 4. 四个 mask 以 `u16` 体素写出, 沿用输入的 affine/header.
///
/// 切片之间相互独立; 启用 `rayon` feature 时前向按切片并行,
/// 结果仍按索引互不重叠地写入.
pub fn segment_with<M: SliceModel + Sync>(
    model: &M,
    input: &Path,
    output_dir: &Path,
    modality: Modality,
) -> Result<Prediction, SegmentError> {
    let (mut vol, work) = KidneyVolume::open_prod(input, modality, output_dir)?;
    info!(
        "已载入 `{}` ({}), 形状 {:?}",
        input.display(),
        modality,
        vol.dim()
    );
    debug!("工作副本: `{}`", work.display());

    vol.normalize_in_place();

    let sections = predict_sections(model, &vol)?;

    let (x, y, z) = vol.dim();
    let mut acc_lk = Array3::<u16>::zeros((x, y, z));
    let mut acc_rk = Array3::<u16>::zeros((x, y, z));
    for (idx, (lk, rk)) in sections.into_iter().enumerate() {
        acc_lk.index_axis_mut(Axis(1), idx).assign(&lk);
        acc_rk.index_axis_mut(Axis(1), idx).assign(&rk);
    }

    let nopp = binary_union(&acc_lk, &acc_rk);
    let lk = post_proc::largest_component(&acc_lk);
    let rk = post_proc::largest_component(&acc_rk);
    let combined = binary_union(&lk, &rk);

    let out = |sfx: &str| -> Result<PathBuf, SegmentError> {
        Ok(output_dir.join(derived_file_name(input, sfx)?))
    };
    let paths = Prediction {
        left_kidney: out(suffix::LEFT_KIDNEY)?,
        right_kidney: out(suffix::RIGHT_KIDNEY)?,
        combined: out(suffix::COMBINED)?,
        combined_nopp: out(suffix::COMBINED_NOPP)?,
    };

    vol.save_mask_like(&lk, &paths.left_kidney)?;
    vol.save_mask_like(&rk, &paths.right_kidney)?;
    vol.save_mask_like(&combined, &paths.combined)?;
    vol.save_mask_like(&nopp, &paths.combined_nopp)?;

    info!("分割完成, 输出位于 `{}`", output_dir.display());
    Ok(paths)
}

/// 逐切片前向, 返回各索引处的 `(左, 右)` 截面 mask.
fn predict_sections<M: SliceModel + Sync>(
    model: &M,
    vol: &KidneyVolume,
) -> Result<Vec<(Array2<u16>, Array2<u16>)>, SegmentError> {
    let (x, _, z) = vol.dim();
    let size = model.input_size();

    let one = |idx: usize| -> Result<(Array2<u16>, Array2<u16>), SegmentError> {
        let input = dataset::network_input(vol, idx, size);
        let (pl, pr) = model.forward(&input)?;
        debug!("切片 {idx} 前向完成");
        Ok((
            mask_to_section(&pl, (x, z)),
            mask_to_section(&pr, (x, z)),
        ))
    };

    #[cfg(feature = "rayon")]
    let sections = (0..vol.slice_count()).into_par_iter().map(one).collect();
    #[cfg(not(feature = "rayon"))]
    let sections = (0..vol.slice_count()).map(one).collect();
    sections
}

/// 将一张概率图变换回体数据截面坐标系并二值化.
///
/// 先按 0.5 将概率二值化, 再做几何逆变换 (转置, 旋转 -90 度,
/// 双线性重采样到 `(X, Z)`), 重采样引入的非整数值按 0.95 的更严阈值
/// 再二值化 (插值半像素只有足够接近前景才算前景), 最后反转第一轴
/// 以抵消提取时的镜像.
fn mask_to_section(prob: &Array2<f32>, out_shape: (usize, usize)) -> Array2<u16> {
    let bin = prob.mapv(|p| if p >= PROB_THRESHOLD { 1.0f32 } else { 0.0 });
    let rotated = transform::rot90_cw(bin.t());
    let resized = transform::resize_bilinear(rotated.view(), out_shape);
    let rebin = resized.mapv(|v| u16::from(v > RESIZE_THRESHOLD));
    rebin.slice(s![..;-1, ..]).to_owned()
}

/// 两个二值 mask 的并: 体素和大于 0 处置 1.
fn binary_union(a: &Array3<u16>, b: &Array3<u16>) -> Array3<u16> {
    ndarray::Zip::from(a)
        .and(b)
        .map_collect(|&x, &y| u16::from(x + y > 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use nifti::writer::WriterOptions;
    use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

    /// 返回固定概率图的网络替身: 左肾全前景, 右肾全背景.
    struct StubModel {
        size: usize,
    }

    impl SliceModel for StubModel {
        fn input_size(&self) -> usize {
            self.size
        }

        fn forward(
            &self,
            slice: &Array2<f32>,
        ) -> Result<(Array2<f32>, Array2<f32>), NetError> {
            let dim = slice.dim();
            Ok((Array2::from_elem(dim, 1.0), Array2::zeros(dim)))
        }
    }

    fn write_input(path: &Path) {
        let data = Array3::from_shape_fn((8, 8, 8), |(i, j, k)| (i + j * 8 + k * 64) as f32);
        let mut h = NiftiHeader::default();
        h.sform_code = 1;
        h.srow_x = [1.0, 0.0, 0.0, 0.0];
        h.srow_y = [0.0, 1.0, 0.0, 0.0];
        h.srow_z = [0.0, 0.0, 1.0, 0.0];
        h.pixdim = [1.0; 8];
        WriterOptions::new(path)
            .reference_header(&h)
            .write_nifti(&data)
            .unwrap();
    }

    #[test]
    fn test_segment_with_stub_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("case1.nii");
        let out_dir = dir.path().join("out");
        write_input(&input);

        let model = StubModel { size: 16 };
        let pred = segment_with(&model, &input, &out_dir, Modality::T2).unwrap();

        assert_eq!(pred.left_kidney.file_name().unwrap(), "case1-prediction-LK.nii");
        assert_eq!(pred.right_kidney.file_name().unwrap(), "case1-prediction-RK.nii");
        assert_eq!(pred.combined.file_name().unwrap(), "case1-prediction.nii");
        assert_eq!(
            pred.combined_nopp.file_name().unwrap(),
            "case1-prediction-nopp.nii"
        );

        for p in [
            &pred.left_kidney,
            &pred.right_kidney,
            &pred.combined,
            &pred.combined_nopp,
        ] {
            let obj = ReaderOptions::new().read_file(p).unwrap();
            let h = obj.header();
            // u16 体素, affine 与输入一致
            assert_eq!(h.datatype, 512);
            assert_eq!(h.srow_x, [1.0, 0.0, 0.0, 0.0]);
            assert_eq!(h.srow_y, [0.0, 1.0, 0.0, 0.0]);
            assert_eq!(h.srow_z, [0.0, 0.0, 1.0, 0.0]);
            assert_eq!(&h.dim[..4], &[3u16, 8, 8, 8]);

            let arr = obj
                .into_volume()
                .into_ndarray::<f32>()
                .unwrap();
            assert!(arr.iter().all(|&v| v == 0.0 || v == 1.0));
        }

        // 左肾全前景, 右肾全背景: 后处理不改变任何一侧,
        // 合并 mask 与未后处理合并 mask 相同.
        let read = |p: &Path| {
            ReaderOptions::new()
                .read_file(p)
                .unwrap()
                .into_volume()
                .into_ndarray::<f32>()
                .unwrap()
        };
        assert_eq!(read(&pred.combined), read(&pred.combined_nopp));
        assert!(read(&pred.left_kidney).iter().all(|&v| v == 1.0));
        assert!(read(&pred.right_kidney).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_missing_weights_is_config_error_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("case2.nii");
        let out_dir = dir.path().join("never-created");
        write_input(&input);

        let missing = dir.path().join("absent.safetensors");
        let err = segment(&input, &out_dir, Modality::T2, &missing).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::Config(ConfigError::MissingWeights { .. })
        ));
        // 前置条件失败时不得产生任何输出目录写入.
        assert!(!out_dir.exists());
    }

    #[test]
    fn test_mask_to_section_binary_output() {
        let prob = Array2::from_shape_fn((6, 6), |(i, j)| if i < 3 && j < 2 { 0.9 } else { 0.1 });
        let m = mask_to_section(&prob, (4, 5));
        assert_eq!(m.dim(), (4, 5));
        assert!(m.iter().all(|&v| v <= 1));
    }

    #[test]
    fn test_binary_union() {
        let mut a = Array3::<u16>::zeros((2, 2, 2));
        let mut b = Array3::<u16>::zeros((2, 2, 2));
        a[(0, 0, 0)] = 1;
        b[(1, 1, 1)] = 1;
        b[(0, 0, 0)] = 1;

        let u = binary_union(&a, &b);
        assert_eq!(u[(0, 0, 0)], 1);
        assert_eq!(u[(1, 1, 1)], 1);
        assert_eq!(u.iter().filter(|&&v| v == 1).count(), 2);
    }
}
