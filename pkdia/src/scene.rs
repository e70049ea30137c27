//! 宿主侧分割对象的数据封送.
//!
//! 该模块只做边界数据整理: 把两个 mask 文件路径组装成一个带固定命名、
//! 配色与 id 的复合分割对象描述, 由宿主应用的 [`SceneRegistrar`]
//! 实现负责真正落入其场景状态. 这里不含任何算法内容.

use std::path::{Path, PathBuf};

/// RGB 显示颜色, 各分量取值 `[0, 1]`.
pub type DisplayColor = (f64, f64, f64);

/// 左肾的固定显示颜色.
pub const LEFT_KIDNEY_COLOR: DisplayColor = (0.7, 0.4, 0.3);

/// 右肾的固定显示颜色.
pub const RIGHT_KIDNEY_COLOR: DisplayColor = (0.8, 0.3, 0.3);

/// 复合分割对象中的一个解剖部分.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SegmentPart {
    /// 宿主侧分割 id.
    pub id: &'static str,

    /// 展示名.
    pub name: &'static str,

    /// 显示颜色.
    pub color: DisplayColor,

    /// 二值 mask 文件路径.
    pub mask_path: PathBuf,
}

/// 双肾复合分割对象描述: 固定两个部分, 左肾在前.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KidneySegmentation {
    /// 左肾与右肾.
    pub parts: [SegmentPart; 2],
}

impl KidneySegmentation {
    /// 由左/右肾 mask 文件路径组装复合分割对象.
    pub fn compose(left_mask: &Path, right_mask: &Path) -> Self {
        Self {
            parts: [
                SegmentPart {
                    id: "Segment_1",
                    name: "Left Kidney",
                    color: LEFT_KIDNEY_COLOR,
                    mask_path: left_mask.to_path_buf(),
                },
                SegmentPart {
                    id: "Segment_2",
                    name: "Right Kidney",
                    color: RIGHT_KIDNEY_COLOR,
                    mask_path: right_mask.to_path_buf(),
                },
            ],
        }
    }
}

/// 宿主场景注册接口.
///
/// 实现方接收复合分割对象描述, 将其注册到宿主管理的场景状态中,
/// 返回宿主侧句柄. 中间的单部分表示由实现方在注册后自行丢弃.
pub trait SceneRegistrar {
    /// 宿主侧分割对象句柄.
    type Handle;

    /// 注册失败的错误类型.
    type Error;

    /// 注册一个复合分割对象, 副作用是宿主场景状态的改变.
    fn register(&mut self, seg: &KidneySegmentation) -> Result<Self::Handle, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_fixed_parts() {
        let seg = KidneySegmentation::compose(Path::new("/o/a-LK.nii"), Path::new("/o/a-RK.nii"));
        assert_eq!(seg.parts[0].name, "Left Kidney");
        assert_eq!(seg.parts[0].id, "Segment_1");
        assert_eq!(seg.parts[0].color, LEFT_KIDNEY_COLOR);
        assert_eq!(seg.parts[1].name, "Right Kidney");
        assert_eq!(seg.parts[1].id, "Segment_2");
        assert_eq!(seg.parts[1].mask_path, Path::new("/o/a-RK.nii"));
    }
}
