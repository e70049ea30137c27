//! 成像模态.

use std::fmt;

use crate::consts::weights;

/// 成像模态. 决定推理所用的权重文件以及载入时的轴向校正行为.
///
/// 该集合是封闭的: 每次运行在开始前选定一个模态, 之后不再改变.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Modality {
    /// MRI T2 加权序列.
    T2,

    /// CT 扫描. 载入时交换第二/第三空间轴 (体素与 affine 同步).
    Ct,
}

impl Modality {
    /// 从外部标签文本解析模态. 仅接受 `"MRI T2"` 与 `"CT"` 的精确匹配,
    /// 其它输入一律返回 `None`.
    pub fn from_label(label: &str) -> Option<Modality> {
        match label {
            "MRI T2" => Some(Modality::T2),
            "CT" => Some(Modality::Ct),
            _ => None,
        }
    }

    /// 标签文本是否是合法模态?
    #[inline]
    pub fn is_valid_label(label: &str) -> bool {
        Self::from_label(label).is_some()
    }

    /// 该模态的外部标签文本.
    #[inline]
    pub const fn label(&self) -> &'static str {
        match self {
            Modality::T2 => "MRI T2",
            Modality::Ct => "CT",
        }
    }

    /// 该模态对应的权重文件名.
    #[inline]
    pub const fn weights_file_name(&self) -> &'static str {
        match self {
            Modality::T2 => weights::T2_FILE,
            Modality::Ct => weights::CT_FILE,
        }
    }

    /// 是否是 CT 模态?
    #[inline]
    pub const fn is_ct(&self) -> bool {
        matches!(self, Modality::Ct)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::Modality;

    #[test]
    fn test_label_round_trip() {
        for m in [Modality::T2, Modality::Ct] {
            assert_eq!(Modality::from_label(m.label()), Some(m));
        }
    }

    #[test]
    fn test_exact_match_only() {
        assert_eq!(Modality::from_label("MRI T2"), Some(Modality::T2));
        assert_eq!(Modality::from_label("CT"), Some(Modality::Ct));

        assert_eq!(Modality::from_label("mri t2"), None);
        assert_eq!(Modality::from_label("MRI T2 "), None);
        assert_eq!(Modality::from_label("T2"), None);
        assert_eq!(Modality::from_label("ct"), None);
        assert_eq!(Modality::from_label(""), None);

        assert!(Modality::is_valid_label("CT"));
        assert!(!Modality::is_valid_label("PET"));
    }
}
