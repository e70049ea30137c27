//! 双解码器分割网络.
//!
//! 一个共享的 transformer 编码器 (见 [`swin`]) 产出多分辨率特征金字塔,
//! 两条结构相同、权重独立的解码器路径分别输出左肾/右肾的单通道得分图.
//! 两个解剖结构相邻而易混淆, 共享上下文、分离通道空间是刻意的设计.
//!
//! 权重以 safetensors 文件存储, 按模态各一份. 网络实例只有在载入权重后
//! 才存在 (构造函数即接收参数), 但不检查权重与模态是否匹配 ——
//! 以错误模态的权重推理属于调用方违约.

use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};
use log::info;
use ndarray::Array2;

pub mod block;
pub mod swin;

use block::{OutConv, TwinUpBlock, UpBlock};
use swin::{FeaturePyramid, SwinConfig, SwinEncoder};

/// 网络层错误.
#[derive(Debug)]
pub enum NetError {
    /// 权重文件不存在.
    MissingWeights(PathBuf),

    /// 张量运行时错误 (权重与结构不匹配、形状错误、设备错误等).
    Runtime(candle_core::Error),

    /// 网络输入尺寸与切片尺寸不一致.
    BadInputShape {
        /// 期望的边长.
        expect: usize,
        /// 实际输入形状.
        got: (usize, usize),
    },
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::MissingWeights(p) => {
                write!(f, "权重文件 `{}` 不存在", p.display())
            }
            NetError::Runtime(e) => write!(f, "张量运行时错误: {e}"),
            NetError::BadInputShape { expect, got } => {
                write!(f, "期望 {expect}x{expect} 输入, 实际为 {got:?}")
            }
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for NetError {
    fn from(e: candle_core::Error) -> Self {
        NetError::Runtime(e)
    }
}

/// 逐切片分割模型.
///
/// 这是推理编排与具体网络实现之间的接口: 输入一张规范化后的 2D 切片,
/// 输出同尺寸的左肾/右肾概率图. 参数在实现构造后只读, `forward`
/// 取 `&self`, 可在多线程间共享.
pub trait SliceModel {
    /// 网络输入分辨率 (高 = 宽).
    fn input_size(&self) -> usize;

    /// 单次前向: 一张切片 -> (左肾概率图, 右肾概率图).
    fn forward(&self, slice: &Array2<f32>) -> Result<(Array2<f32>, Array2<f32>), NetError>;
}

/// 单条解码器路径: 五级上采样 + skip 拼接, 末端 1x1 卷积出单通道得分.
#[derive(Debug)]
struct Decoder {
    up1: UpBlock,
    up2: UpBlock,
    up3: UpBlock,
    up4: TwinUpBlock,
    in_conv: Conv2d,
    up5: UpBlock,
    out: OutConv,
}

impl Decoder {
    fn new(cfg: &SwinConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let e = cfg.embed_dim;
        let in_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            up1: UpBlock::new(8 * e, 4 * e, 8 * e, 4, vb.pp("up1"))?,
            up2: UpBlock::new(4 * e, 2 * e, 4 * e, 4, vb.pp("up2"))?,
            up3: UpBlock::new(2 * e, e, 2 * e, 2, vb.pp("up3"))?,
            up4: TwinUpBlock::new(e, e / 2, e, 2, vb.pp("up4"))?,
            in_conv: conv2d(cfg.in_chans, e / 2, 3, in_cfg, vb.pp("in_conv"))?,
            up5: UpBlock::new(e / 2, e / 2, e, 2, vb.pp("up5"))?,
            out: OutConv::new(e / 2, 1, vb.pp("out"))?,
        })
    }

    /// `x` 为网络原始输入 (供最浅层 skip), `f` 为编码器金字塔.
    fn forward(&self, x: &Tensor, f: &FeaturePyramid) -> candle_core::Result<Tensor> {
        let y = self.up1.forward(&f.x5, &f.x4)?;
        let y = self.up2.forward(&y, &f.x3)?;
        let y = self.up3.forward(&y, &f.x2)?;
        let y = self.up4.forward(&y, &f.x1)?;
        let skip = self.in_conv.forward(x)?;
        let y = self.up5.forward(&y, &skip)?;
        self.out.forward(&y)
    }
}

/// 双解码器分割网络.
#[derive(Debug)]
pub struct DualDecoderNet {
    encoder: SwinEncoder,
    left: Decoder,
    right: Decoder,
    device: Device,
    img_size: usize,
}

impl DualDecoderNet {
    /// 按 `cfg` 构建网络, 参数取自 `vb`.
    pub fn new(cfg: &SwinConfig, vb: VarBuilder) -> Result<Self, NetError> {
        let device = vb.device().clone();
        Ok(Self {
            encoder: SwinEncoder::new(cfg, vb.pp("encoder"))?,
            left: Decoder::new(cfg, vb.pp("decoder_lk"))?,
            right: Decoder::new(cfg, vb.pp("decoder_rk"))?,
            device,
            img_size: cfg.img_size,
        })
    }

    /// 从 safetensors 权重文件载入默认结构的网络.
    ///
    /// 权重文件不存在时立即返回 [`NetError::MissingWeights`],
    /// 不做任何张量初始化.
    pub fn from_weights<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self, NetError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(NetError::MissingWeights(path.to_path_buf()));
        }
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        let net = Self::new(&SwinConfig::default(), vb)?;
        info!("已载入权重 `{}`", path.display());
        Ok(net)
    }

    /// 张量级前向: `(B, 1, H, W)` -> 两张 `(B, 1, H, W)` 原始得分图.
    pub fn forward_t(&self, x: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let f = self.encoder.forward(x)?;
        let lk = self.left.forward(x, &f)?;
        let rk = self.right.forward(x, &f)?;
        Ok((lk, rk))
    }
}

impl SliceModel for DualDecoderNet {
    #[inline]
    fn input_size(&self) -> usize {
        self.img_size
    }

    fn forward(&self, slice: &Array2<f32>) -> Result<(Array2<f32>, Array2<f32>), NetError> {
        let (h, w) = slice.dim();
        if h != self.img_size || w != self.img_size {
            return Err(NetError::BadInputShape {
                expect: self.img_size,
                got: (h, w),
            });
        }

        let flat: Vec<f32> = slice.iter().copied().collect();
        let x = Tensor::from_vec(flat, (1, 1, h, w), &self.device)?;
        let (lk, rk) = self.forward_t(&x)?;
        let lk = candle_nn::ops::sigmoid(&lk)?;
        let rk = candle_nn::ops::sigmoid(&rk)?;
        Ok((to_map(&lk, h, w)?, to_map(&rk, h, w)?))
    }
}

/// `(1, 1, h, w)` 张量 -> `Array2<f32>`.
fn to_map(t: &Tensor, h: usize, w: usize) -> Result<Array2<f32>, NetError> {
    let flat = t.flatten_all()?.to_vec1::<f32>()?;
    // 长度恒为 h * w, 该操作不会生成 `Err`, 可直接 unwrap.
    Ok(Array2::from_shape_vec((h, w), flat).unwrap())
}

/// 选择推理设备: 有可用 CUDA 设备则用之, 否则回退 CPU.
/// 每次编排调用决定一次, 运行期间不再改变.
pub fn default_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(d) => {
            if d.is_cuda() {
                info!("使用 CUDA 设备推理");
            } else {
                info!("使用 CPU 推理");
            }
            d
        }
        Err(e) => {
            log::warn!("CUDA 初始化失败 ({e}), 回退 CPU");
            Device::Cpu
        }
    }
}
