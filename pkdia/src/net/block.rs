//! 解码器卷积积木.

use candle_core::{Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d, BatchNorm, Conv2d, Conv2dConfig, ConvTranspose2d,
    ConvTranspose2dConfig, Module, ModuleT, VarBuilder,
};

/// Conv2d(3x3, pad 1) + BN + ReLU.
#[derive(Debug)]
pub struct ConvBnRelu {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBnRelu {
    /// `in_chan -> out_chan`.
    pub fn new(in_chan: usize, out_chan: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(in_chan, out_chan, 3, cfg, vb.pp("conv"))?;
        let bn = batch_norm(out_chan, 1e-5, vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }
}

impl Module for ConvBnRelu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // 推理路径, BN 固定使用 running statistics.
        self.bn.forward_t(&self.conv.forward(xs)?, false)?.relu()
    }
}

/// {Conv2d, BN, ReLU} x n.
#[derive(Debug)]
pub struct ConvStack {
    layers: Vec<ConvBnRelu>,
}

impl ConvStack {
    /// 构建 `n` 层堆叠 (`n >= 1`). 第一层 `in_chan -> out_chan`,
    /// 其余层保持 `out_chan`.
    pub fn new(in_chan: usize, out_chan: usize, n: usize, vb: VarBuilder) -> Result<Self> {
        assert!(n >= 1, "ConvStack 至少一层");
        let mut layers = Vec::with_capacity(n);
        for i in 0..n {
            let cin = if i == 0 { in_chan } else { out_chan };
            layers.push(ConvBnRelu::new(cin, out_chan, vb.pp(i.to_string()))?);
        }
        Ok(Self { layers })
    }
}

impl Module for ConvStack {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = xs.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
}

/// ConvTranspose2d(2x2, stride 2) 上采样 + skip 拼接 + 卷积堆叠.
#[derive(Debug)]
pub struct UpBlock {
    up: ConvTranspose2d,
    conv: ConvStack,
}

impl UpBlock {
    /// `in_chan -> out_chan` 上采样; 与 skip 拼接后通道数为 `mid_chan`,
    /// 再经 `n_convs` 层卷积回到 `out_chan`.
    pub fn new(
        in_chan: usize,
        out_chan: usize,
        mid_chan: usize,
        n_convs: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        let up = conv_transpose2d(in_chan, out_chan, 2, cfg, vb.pp("up"))?;
        let conv = ConvStack::new(mid_chan, out_chan, n_convs, vb.pp("conv"))?;
        Ok(Self { up, conv })
    }

    /// `x` 来自下层解码特征, `skip` 为同分辨率的编码器特征.
    pub fn forward(&self, x: &Tensor, skip: &Tensor) -> Result<Tensor> {
        let x = self.up.forward(x)?;
        let x = Tensor::cat(&[&x, skip], 1)?;
        self.conv.forward(&x)
    }
}

/// 同 [`UpBlock`], 但上采样同时作用于解码特征与 skip 两路
/// (两路分辨率一致, 共用同一个反卷积).
#[derive(Debug)]
pub struct TwinUpBlock {
    up: ConvTranspose2d,
    conv: ConvStack,
}

impl TwinUpBlock {
    /// 参数含义同 [`UpBlock::new`].
    pub fn new(
        in_chan: usize,
        out_chan: usize,
        mid_chan: usize,
        n_convs: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        let up = conv_transpose2d(in_chan, out_chan, 2, cfg, vb.pp("up"))?;
        let conv = ConvStack::new(mid_chan, out_chan, n_convs, vb.pp("conv"))?;
        Ok(Self { up, conv })
    }

    /// 两路输入分辨率一致, 均经同一个反卷积上采样后拼接.
    pub fn forward(&self, x: &Tensor, skip: &Tensor) -> Result<Tensor> {
        let x = self.up.forward(x)?;
        let skip = self.up.forward(skip)?;
        let x = Tensor::cat(&[&x, &skip], 1)?;
        self.conv.forward(&x)
    }
}

/// 1x1 输出卷积.
#[derive(Debug)]
pub struct OutConv {
    conv: Conv2d,
}

impl OutConv {
    /// `in_chan -> out_chan`.
    pub fn new(in_chan: usize, out_chan: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv2d(in_chan, out_chan, 1, Default::default(), vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for OutConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}
