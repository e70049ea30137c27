//! 运行环境探测与前置条件检查.
//!
//! 依赖可用性不靠异常捕获推断, 而是显式查询:
//! [`RuntimeSupport::probe`] 枚举加速器与各模态权重的在位情况,
//! [`require_weights`] 在任何计算开始之前完成权重前置条件检查.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::consts::weights;
use crate::Modality;

/// 配置错误. 均在推理开始前被检出, 此时不会产生任何计算或输出.
#[derive(Debug)]
pub enum ConfigError {
    /// 模态标签不合法.
    UnknownModality(String),

    /// 所选模态的权重文件不存在.
    MissingWeights {
        /// 所选模态.
        modality: Modality,
        /// 探测过的权重路径.
        path: PathBuf,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownModality(s) => {
                write!(f, "未知模态 `{s}` (合法值: \"MRI T2\", \"CT\")")
            }
            ConfigError::MissingWeights { modality, path } => {
                write!(
                    f,
                    "模态 {modality} 的权重文件 `{}` 不存在",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// 解析模态标签, 失败时给出配置错误.
pub fn parse_modality(label: &str) -> Result<Modality, ConfigError> {
    Modality::from_label(label).ok_or_else(|| ConfigError::UnknownModality(label.to_string()))
}

/// 权重目录.
///
/// 1. 若环境变量 `$PKDIA_WEIGHTS_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `{用户主目录}/.pkdia/weights`.
pub fn weights_dir() -> PathBuf {
    if let Ok(d) = env::var(weights::DIR_ENV) {
        if !d.is_empty() {
            return PathBuf::from(d);
        }
    }
    let mut ans = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    ans.push(".pkdia");
    ans.push("weights");
    ans
}

/// 模态 `m` 在默认权重目录下的权重文件全路径.
#[inline]
pub fn weights_path(m: Modality) -> PathBuf {
    weights_dir().join(m.weights_file_name())
}

/// 权重前置条件检查: 显式给定路径优先, 否则落到默认目录.
/// 文件不存在时返回 [`ConfigError::MissingWeights`].
pub fn require_weights(m: Modality, explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| weights_path(m));
    if path.is_file() {
        Ok(path)
    } else {
        Err(ConfigError::MissingWeights { modality: m, path })
    }
}

/// 运行环境支持情况的结构化报告.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RuntimeSupport {
    /// CUDA 加速器是否可用.
    pub accelerator: bool,

    /// 探测所用的权重目录.
    pub weights_dir: PathBuf,

    /// T2 权重文件 (在位时为其全路径).
    pub weights_t2: Option<PathBuf>,

    /// CT 权重文件 (在位时为其全路径).
    pub weights_ct: Option<PathBuf>,
}

impl RuntimeSupport {
    /// 探测当前进程的运行环境.
    pub fn probe() -> Self {
        let dir = weights_dir();
        let find = |m: Modality| {
            let p = dir.join(m.weights_file_name());
            p.is_file().then_some(p)
        };
        Self {
            accelerator: Device::cuda_if_available(0)
                .map(|d| d.is_cuda())
                .unwrap_or(false),
            weights_t2: find(Modality::T2),
            weights_ct: find(Modality::Ct),
            weights_dir: dir,
        }
    }

    /// 模态 `m` 的权重是否在位?
    #[inline]
    pub fn has_weights(&self, m: Modality) -> bool {
        match m {
            Modality::T2 => self.weights_t2.is_some(),
            Modality::Ct => self.weights_ct.is_some(),
        }
    }
}

impl fmt::Display for RuntimeSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "accelerator: {}",
            if self.accelerator { "cuda" } else { "cpu" }
        )?;
        writeln!(f, "weights dir: {}", self.weights_dir.display())?;
        for (m, p) in [
            (Modality::T2, &self.weights_t2),
            (Modality::Ct, &self.weights_ct),
        ] {
            match p {
                Some(p) => writeln!(f, "{m}: {}", p.display())?,
                None => writeln!(f, "{m}: 缺失 ({})", m.weights_file_name())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modality() {
        assert_eq!(parse_modality("CT").unwrap(), Modality::Ct);
        assert!(matches!(
            parse_modality("pet"),
            Err(ConfigError::UnknownModality(_))
        ));
    }

    #[test]
    fn test_require_weights_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join(Modality::T2.weights_file_name());
        std::fs::write(&p, b"x").unwrap();

        assert_eq!(require_weights(Modality::T2, Some(&p)).unwrap(), p);

        let missing = dir.path().join("nope.safetensors");
        let err = require_weights(Modality::T2, Some(&missing)).unwrap_err();
        match err {
            ConfigError::MissingWeights { modality, path } => {
                assert_eq!(modality, Modality::T2);
                assert_eq!(path, missing);
            }
            other => panic!("意外错误: {other}"),
        }
    }
}
