#![warn(missing_docs)]

//! 核心库. 提供多囊肾 (ADPKD) 3D MRI T2 / CT nifti 扫描的左右肾
//! 自动分割推理管线.
//!
//! 管线自底向上由以下环节组成:
//!
//! 1. 体数据载入与轴向规范化 (`data`): 读取 nifti, 重排到规范轴序,
//!   CT 模态额外做一次轴交换; affine/header 原样传播到所有输出.
//! 2. 灰度规范化 (`data::normalize`): 全局 mean/std, 带近零方差保护.
//! 3. 切片采样 (`dataset`): 沿采样轴逐层镜像/重采样/旋转/百分位拉伸,
//!   得到 256x256 的 8-bit 网络输入.
//! 4. 双解码器分割网络 (`net`): 共享 transformer 编码器 + 左右肾
//!   两条独立解码路径, safetensors 权重按模态各一份.
//! 5. 推理编排 (`infer`): 逐切片前向, 3D 重建, 阈值化,
//!   输出四个 mask 文件.
//! 6. 后处理 (`post_proc`): 6-连通最大连通域提取, 去除小的假阳性.
//! 7. 宿主封送 (`scene`): 把 mask 文件组装成宿主分割对象描述.
//!
//! # 注意
//!
//! 1. 该 crate 只负责推理, 不涉及网络训练.
//! 2. 体数据格式目前仅适配 nifti (`.nii` / `.nii.gz`).
//! 3. 推理对相同输入与权重是确定的; 管线不做任何重试,
//!   一次运行要么整体完成要么整体失败.
//! 4. 在非期望情况下 (索引越界、形状不一致等), 程序会直接 panic,
//!   而不会导致内存错误. As what Rust promises.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

pub mod consts;

mod modality;

pub use modality::Modality;

pub mod data;

pub use data::{KidneyVolume, VolumeError, VolumeMeta};

pub mod dataset;
pub mod infer;
pub mod net;
pub mod post_proc;
pub mod probe;
pub mod scene;
pub mod transform;

pub use infer::{segment, segment_with, Prediction, SegmentError};
pub use net::SliceModel;
pub use probe::{ConfigError, RuntimeSupport};

pub mod prelude;
