//! 3D 体数据基础结构.
//!
//! [`KidneyVolume`] 以 nifti 文件的 `[X, Y, Z]` 轴序保存体素 (f32),
//! 并同时维护与之一致的 4x4 affine 与 header. 载入时完成轴向规范化
//! (以及 CT 模态的轴交换), 此后 affine/header 原样传播到所有派生输出.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView2, ArrayView3, ArrayViewMut, Axis, Dimension, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiError, NiftiHeader, NiftiObject, ReaderOptions};

use crate::consts::suffix;
use crate::{Idx3d, Modality};

pub mod affine;
pub mod orient;

pub use affine::Affine;

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 体数据载入/存储错误.
#[derive(Debug)]
pub enum VolumeError {
    /// 底层 nifti 读写错误.
    Nifti(NiftiError),

    /// 其他底层 I/O 错误.
    Io(std::io::Error),

    /// 文件内容不是三维体数据.
    NotVolume(Vec<usize>),

    /// 文件名不含 stem 或扩展名, 无法派生输出文件名.
    BadFileName(PathBuf),
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeError::Nifti(e) => write!(f, "nifti 读写错误: {e}"),
            VolumeError::Io(e) => write!(f, "I/O 错误: {e}"),
            VolumeError::NotVolume(dims) => {
                write!(f, "期望三维体数据, 实际形状为 {dims:?}")
            }
            VolumeError::BadFileName(p) => {
                write!(f, "无法从 `{}` 派生输出文件名", p.display())
            }
        }
    }
}

impl std::error::Error for VolumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VolumeError::Nifti(e) => Some(e),
            VolumeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NiftiError> for VolumeError {
    fn from(e: NiftiError) -> Self {
        VolumeError::Nifti(e)
    }
}

impl From<std::io::Error> for VolumeError {
    fn from(e: std::io::Error) -> Self {
        VolumeError::Io(e)
    }
}

/// 全局 mean/std 规范化, 原地修改.
///
/// 若标准差向零取整后为 0 (近似常值输入的除零保护), 则数据保持原样.
/// 对任意维度的数组均适用; 空数组为 no-op.
pub fn normalize<D: Dimension>(mut a: ArrayViewMut<f32, D>) {
    if a.is_empty() {
        return;
    }
    let mean = a.mean().unwrap();
    let std = a.std(0.0);
    if std as i32 == 0 {
        return;
    }
    a.mapv_inplace(|v| (v - mean) / std);
}

/// 将文件名在第一个 `.` 处拆为 `(stem, ext)`.
/// `"case7.nii.gz"` -> `("case7", "nii.gz")`.
fn split_name(name: &str) -> Option<(&str, &str)> {
    let dot = name.find('.')?;
    if dot == 0 || dot + 1 == name.len() {
        return None;
    }
    Some((&name[..dot], &name[dot + 1..]))
}

/// 由输入路径派生 `<stem><suffix>.<ext>` 形式的文件名.
pub fn derived_file_name(input: &Path, suffix: &str) -> Result<String, VolumeError> {
    let name = input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VolumeError::BadFileName(input.to_path_buf()))?;
    let (stem, ext) =
        split_name(name).ok_or_else(|| VolumeError::BadFileName(input.to_path_buf()))?;
    Ok(format!("{stem}{suffix}.{ext}"))
}

/// nifti header 的共用属性.
pub trait VolumeMeta {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取体素网格形状 `(X, Y, Z)`.
    #[inline]
    fn shape(&self) -> Idx3d {
        let [_, x, y, z, ..] = self.header().dim;
        (x as usize, y as usize, z as usize)
    }

    /// 获取体素总数.
    #[inline]
    fn voxel_count(&self) -> usize {
        let (x, y, z) = self.shape();
        x * y * z
    }

    /// 获取单体素分辨率 `[x, y, z]`, 以毫米为单位.
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, x, y, z, ..] = self.header().pixdim;
        [x as f64, y as f64, z as f64]
    }
}

/// nifti 格式 3D 扫描体数据. 体素以 `f32` 保存, 轴序为 `[X, Y, Z]`.
#[derive(Debug, Clone)]
pub struct KidneyVolume {
    header: BoxedHeader,
    affine: Affine,
    data: Array3<f32>,
}

impl VolumeMeta for KidneyVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl KidneyVolume {
    /// 打开 nifti 文件格式的 3D 扫描并做预处理:
    ///
    /// 1. 读取体素数组与 header, 由 header 重建 affine;
    /// 2. 重排到最接近的规范轴序 (体素与 affine 同步);
    /// 3. 若模态为 CT, 额外交换第二/第三空间轴 (仅此一次);
    /// 4. 将调整后的 affine 与形状回写到 header.
    pub fn open<P: AsRef<Path>>(path: P, modality: Modality) -> Result<Self, VolumeError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let mut header = Box::new(obj.header().clone());

        let data = obj.into_volume().into_ndarray::<f32>()?;
        let dims = data.shape().to_vec();
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeError::NotVolume(dims))?;

        let aff = affine::from_header(&header);
        let (data, aff) = orient::to_canonical(data, aff);
        let (data, aff) = if modality.is_ct() {
            orient::swap_axes_1_2(data, aff)
        } else {
            (data, aff)
        };

        let (x, y, z) = data.dim();
        header.dim = [3, x as u16, y as u16, z as u16, 1, 1, 1, 1];
        affine::write_to_header(&mut header, aff.view());

        Ok(Self {
            header,
            affine: aff,
            data,
        })
    }

    /// 同 [`Self::open`], 并把预处理后的工作副本以 `<stem>-prod.<ext>`
    /// 写入 `out_dir` (目录不存在时创建). 返回体数据与副本路径.
    pub fn open_prod<P: AsRef<Path>>(
        path: P,
        modality: Modality,
        out_dir: &Path,
    ) -> Result<(Self, PathBuf), VolumeError> {
        let vol = Self::open(path.as_ref(), modality)?;
        fs::create_dir_all(out_dir)?;
        let work = out_dir.join(derived_file_name(path.as_ref(), suffix::WORK_COPY)?);
        vol.save(&work)?;
        Ok((vol, work))
    }

    /// 将体数据按当前 header/affine 保存到 `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VolumeError> {
        WriterOptions::new(path.as_ref())
            .reference_header(&self.header)
            .write_nifti(&self.data)?;
        Ok(())
    }

    /// 将一个与本体数据同形状的 mask 以 `u16` 体素保存到 `path`,
    /// 沿用本体数据的 header/affine.
    ///
    /// 如果形状不一致, 则 panic.
    pub fn save_mask_like<P: AsRef<Path>>(
        &self,
        mask: &Array3<u16>,
        path: P,
    ) -> Result<(), VolumeError> {
        assert_eq!(mask.dim(), self.data.dim(), "mask 形状与体数据不一致");
        WriterOptions::new(path.as_ref())
            .reference_header(&self.header)
            .write_nifti(mask)?;
        Ok(())
    }

    /// 全局 mean/std 规范化, 原地修改. 见 [`normalize`].
    #[inline]
    pub fn normalize_in_place(&mut self) {
        normalize(self.data.view_mut());
    }

    /// 采样轴 (第二空间轴) 的切片个数.
    #[inline]
    pub fn slice_count(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    /// 获取沿采样轴第 `idx` 层的 2D 截面视图, 形状 `(X, Z)`.
    ///
    /// 当 `idx` 越界时 panic.
    #[inline]
    pub fn cross_section(&self, idx: usize) -> ArrayView2<f32> {
        self.data.index_axis(Axis(1), idx)
    }

    /// 获得体素数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 获取 affine 视图.
    #[inline]
    pub fn affine(&self) -> ArrayView2<'_, f64> {
        self.affine.view()
    }

    /// 体素网格形状 `(X, Y, Z)`.
    #[inline]
    pub fn dim(&self) -> Idx3d {
        self.data.dim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    #[test]
    fn test_normalize_statistics() {
        let mut a = Array2::from_shape_fn((16, 16), |(i, j)| (i * 16 + j) as f32);
        normalize(a.view_mut());
        let mean = a.mean().unwrap();
        let std = a.std(0.0);
        assert!(mean.abs() < 1e-5);
        assert!((std - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_constant_unchanged() {
        let mut a = Array2::from_elem((8, 8), 42.0_f32);
        normalize(a.view_mut());
        assert!(a.iter().all(|&v| v == 42.0));
    }

    #[test]
    fn test_normalize_sub_unit_std_unchanged() {
        // 标准差小于 1 时向零取整为 0, 数据保持原样.
        let mut a = Array2::from_shape_fn((2, 2), |(i, j)| 0.1 * (i * 2 + j) as f32);
        let before = a.clone();
        normalize(a.view_mut());
        assert_eq!(a, before);
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("case7.nii.gz"), Some(("case7", "nii.gz")));
        assert_eq!(split_name("a.nii"), Some(("a", "nii")));
        assert_eq!(split_name("no_ext"), None);
        assert_eq!(split_name(".hidden"), None);
        assert_eq!(split_name("trailing."), None);
    }

    #[test]
    fn test_derived_file_name() {
        let p = Path::new("/some/dir/case7.nii.gz");
        assert_eq!(
            derived_file_name(p, "-prediction-LK").unwrap(),
            "case7-prediction-LK.nii.gz"
        );
        assert_eq!(derived_file_name(p, "-prod").unwrap(), "case7-prod.nii.gz");
        assert!(derived_file_name(Path::new("/dir/noext"), "-x").is_err());
    }

    fn canonical_header() -> NiftiHeader {
        let mut h = NiftiHeader::default();
        h.sform_code = 1;
        h.srow_x = [1.0, 0.0, 0.0, 0.0];
        h.srow_y = [0.0, 1.0, 0.0, 0.0];
        h.srow_z = [0.0, 0.0, 1.0, 0.0];
        h.pixdim = [1.0; 8];
        h
    }

    fn write_volume(path: &Path, data: &Array3<f32>) {
        WriterOptions::new(path)
            .reference_header(&canonical_header())
            .write_nifti(data)
            .unwrap();
    }

    #[test]
    fn test_ct_axis_swap_against_t2() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii");
        let data = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        write_volume(&path, &data);

        let t2 = KidneyVolume::open(&path, Modality::T2).unwrap();
        let ct = KidneyVolume::open(&path, Modality::Ct).unwrap();

        assert_eq!(t2.dim(), (2, 3, 4));
        assert_eq!(ct.dim(), (2, 4, 3));
        assert_eq!(t2.data()[(1, 2, 3)], 123.0);
        assert_eq!(ct.data()[(1, 3, 2)], 123.0);

        // affine 的第二/第三空间列交换
        assert_eq!(t2.affine()[(1, 1)], 1.0);
        assert_eq!(ct.affine()[(1, 1)], 0.0);
        assert_eq!(ct.affine()[(1, 2)], 1.0);
        assert_eq!(ct.affine()[(2, 1)], 1.0);
    }

    #[test]
    fn test_open_prod_writes_work_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.nii");
        let out = dir.path().join("out");
        let data = Array3::from_elem((4, 4, 4), 1.0_f32);
        write_volume(&path, &data);

        let (_, work) = KidneyVolume::open_prod(&path, Modality::T2, &out).unwrap();
        assert_eq!(work.file_name().unwrap(), "scan-prod.nii");
        assert!(work.is_file());
    }
}
