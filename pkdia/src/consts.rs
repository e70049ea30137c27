//! 通用常量.

/// 网络输入切片分辨率 (高 = 宽).
pub const IMG_SIZE: usize = 256;

/// 概率图的二值化阈值. 在几何逆变换之前施加.
pub const PROB_THRESHOLD: f32 = 0.5;

/// 几何逆变换 (插值重采样) 之后的再二值化阈值.
/// 比 [`PROB_THRESHOLD`] 更严格, 以抑制插值产生的半像素泄漏.
pub const RESIZE_THRESHOLD: f32 = 0.95;

/// 对比度拉伸的下百分位.
pub const PERCENTILE_LOW: f64 = 1.0;

/// 对比度拉伸的上百分位.
pub const PERCENTILE_HIGH: f64 = 99.0;

/// mask 体素值.
pub mod mask {
    /// 输出 mask 中, 背景的体素值.
    pub const BACKGROUND: u16 = 0;

    /// 输出 mask 中, 肾脏前景的体素值.
    pub const FOREGROUND: u16 = 1;

    /// 体素是否是前景?
    #[inline]
    pub const fn is_foreground(v: u16) -> bool {
        v != BACKGROUND
    }
}

/// 权重文件相关常量.
pub mod weights {
    /// MRI T2 模态的权重文件名.
    pub const T2_FILE: &str = "PKDIAv1-weights.safetensors";

    /// CT 模态的权重文件名.
    pub const CT_FILE: &str = "PKDIAv2-weights.safetensors";

    /// 指定权重目录的环境变量名.
    pub const DIR_ENV: &str = "PKDIA_WEIGHTS_DIR";
}

/// 输出文件名后缀. 均附加在输入文件 stem 之后, 保留原扩展名.
pub mod suffix {
    /// 左肾 mask.
    pub const LEFT_KIDNEY: &str = "-prediction-LK";

    /// 右肾 mask.
    pub const RIGHT_KIDNEY: &str = "-prediction-RK";

    /// 左右肾合并 mask (已后处理).
    pub const COMBINED: &str = "-prediction";

    /// 左右肾合并 mask (未后处理).
    pub const COMBINED_NOPP: &str = "-prediction-nopp";

    /// 预处理后的工作副本.
    pub const WORK_COPY: &str = "-prod";
}
