//! 共享编码器: 窗口注意力 transformer, 四级下采样特征金字塔.
//!
//! 结构要点:
//!
//! 1. patch embedding 以 4x4 卷积一次性下采样 4 倍;
//! 2. 四个 stage 产出 96/192/384/768 通道的金字塔, stage 间以
//!   patch merging 下采样 2 倍;
//! 3. block 内为窗口多头自注意力 (奇数 block 平移半窗并加注意力掩码),
//!   余弦相似度注意力带可学习 (截断) 的对数缩放, 相对位置偏置由
//!   对数间隔坐标上的小 MLP 给出, 残差分支后置归一化.

use candle_core::{Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    conv2d, layer_norm, linear, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder,
};
use itertools::iproduct;

/// ln(100). 注意力对数缩放的截断上限.
const LOGIT_SCALE_MAX: f64 = 4.605_170_185_988_092;

/// 编码器结构超参数.
#[derive(Clone, Debug)]
pub struct SwinConfig {
    /// 输入分辨率 (高 = 宽).
    pub img_size: usize,
    /// patch embedding 下采样倍数.
    pub patch_size: usize,
    /// 输入通道数.
    pub in_chans: usize,
    /// 第一个 stage 的通道数, 逐 stage 翻倍.
    pub embed_dim: usize,
    /// 各 stage 的 block 个数.
    pub depths: [usize; 4],
    /// 各 stage 的注意力头数.
    pub num_heads: [usize; 4],
    /// 注意力窗口边长.
    pub window: usize,
    /// MLP 隐层倍率.
    pub mlp_ratio: usize,
}

impl Default for SwinConfig {
    fn default() -> Self {
        Self {
            img_size: crate::consts::IMG_SIZE,
            patch_size: 4,
            in_chans: 1,
            embed_dim: 96,
            depths: [2, 2, 6, 2],
            num_heads: [3, 6, 12, 24],
            window: 8,
            mlp_ratio: 4,
        }
    }
}

/// 沿 `dim` 轴循环移位 `shift` (可为负).
fn roll(x: &Tensor, dim: usize, shift: i64) -> Result<Tensor> {
    let size = x.dim(dim)? as i64;
    let shift = shift.rem_euclid(size) as usize;
    if shift == 0 {
        return Ok(x.clone());
    }
    let size = size as usize;
    let tail = x.narrow(dim, size - shift, shift)?;
    let head = x.narrow(dim, 0, size - shift)?;
    Tensor::cat(&[&tail, &head], dim)
}

/// `(B, H, W, C)` -> `(B * nW, window^2, C)`.
///
/// 如果窗口边长不能整除特征图边长, 则 panic.
fn window_partition(x: &Tensor, window: usize) -> Result<Tensor> {
    let (b, h, w, c) = x.dims4()?;
    assert_eq!(h % window, 0, "窗口必须整除特征图高");
    assert_eq!(w % window, 0, "窗口必须整除特征图宽");
    let x = x.reshape((b, h / window, window, w / window, window, c))?;
    let x = x.permute((0, 1, 3, 2, 4, 5))?.contiguous()?;
    x.reshape((b * (h / window) * (w / window), window * window, c))
}

/// [`window_partition`] 的逆操作.
fn window_reverse(x: &Tensor, window: usize, b: usize, h: usize, w: usize) -> Result<Tensor> {
    let c = x.dim(D::Minus1)?;
    let x = x.reshape((b, h / window, w / window, window, window, c))?;
    let x = x.permute((0, 1, 3, 2, 4, 5))?.contiguous()?;
    x.reshape((b, h, w, c))
}

/// 沿最后一维做 L2 归一化.
fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    x.broadcast_div(&(norm + 1e-6)?)
}

/// patch embedding: 4x4 stride-4 卷积 + LayerNorm.
#[derive(Debug)]
struct PatchEmbed {
    proj: Conv2d,
    norm: LayerNorm,
}

impl PatchEmbed {
    fn new(cfg: &SwinConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = conv2d(
            cfg.in_chans,
            cfg.embed_dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        let norm = layer_norm(cfg.embed_dim, 1e-5, vb.pp("norm"))?;
        Ok(Self { proj, norm })
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x = self.proj.forward(xs)?;
        // LayerNorm 作用于通道维, 临时转为 BHWC.
        let x = x.permute((0, 2, 3, 1))?.contiguous()?;
        let x = self.norm.forward(&x)?;
        x.permute((0, 3, 1, 2))?.contiguous()
    }
}

/// 窗口多头自注意力.
#[derive(Debug)]
struct WindowAttention {
    qkv: Linear,
    proj: Linear,
    /// 每头一个可学习对数缩放, `(heads, 1, 1)`.
    logit_scale: Tensor,
    cpb_fc1: Linear,
    cpb_fc2: Linear,
    /// 对数间隔相对坐标表, `((2w-1)^2, 2)`.
    rel_table: Tensor,
    /// 位置对 -> 相对坐标表行号, `(w^2 * w^2,)`.
    rel_index: Tensor,
    num_heads: usize,
    window: usize,
}

impl WindowAttention {
    fn new(dim: usize, num_heads: usize, window: usize, vb: VarBuilder) -> Result<Self> {
        let qkv = linear(dim, dim * 3, vb.pp("qkv"))?;
        let proj = linear(dim, dim, vb.pp("proj"))?;
        let logit_scale = vb.get((num_heads, 1, 1), "logit_scale")?;
        let cpb_fc1 = linear(2, 512, vb.pp("cpb_fc1"))?;
        let cpb_fc2 = linear(512, num_heads, vb.pp("cpb_fc2"))?;

        let side = 2 * window - 1;
        let mut table = Vec::with_capacity(side * side * 2);
        for (dy, dx) in iproduct!(0..side, 0..side) {
            let dy = dy as f64 - (window - 1) as f64;
            let dx = dx as f64 - (window - 1) as f64;
            table.push(log_spaced(dy, window) as f32);
            table.push(log_spaced(dx, window) as f32);
        }
        let rel_table = Tensor::from_vec(table, (side * side, 2), vb.device())?;

        let n = window * window;
        let mut index = Vec::with_capacity(n * n);
        for (i, j) in iproduct!(0..n, 0..n) {
            let dy = (i / window) as i64 - (j / window) as i64 + window as i64 - 1;
            let dx = (i % window) as i64 - (j % window) as i64 + window as i64 - 1;
            index.push((dy * side as i64 + dx) as u32);
        }
        let rel_index = Tensor::from_vec(index, n * n, vb.device())?;

        Ok(Self {
            qkv,
            proj,
            logit_scale,
            cpb_fc1,
            cpb_fc2,
            rel_table,
            rel_index,
            num_heads,
            window,
        })
    }

    /// 相对位置偏置 `(heads, n, n)`.
    fn position_bias(&self) -> Result<Tensor> {
        let n = self.window * self.window;
        let t = self.cpb_fc1.forward(&self.rel_table)?.relu()?;
        let t = self.cpb_fc2.forward(&t)?;
        let bias = t
            .index_select(&self.rel_index, 0)?
            .reshape((n, n, self.num_heads))?
            .permute((2, 0, 1))?
            .contiguous()?;
        candle_nn::ops::sigmoid(&bias)? * 16.0
    }

    /// `x` 为窗口批 `(B * nW, n, C)`; `mask` 为平移窗口的加性掩码
    /// `(nW, n, n)`, 无平移时为 `None`.
    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, n, c) = x.dims3()?;
        let head_dim = c / self.num_heads;

        let qkv = self
            .qkv
            .forward(x)?
            .reshape((b, n, 3, self.num_heads, head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        // 余弦相似度注意力: q/k 归一化后以截断的可学习尺度放大.
        let q = l2_normalize(&q)?;
        let k = l2_normalize(&k)?;
        let scale = self.logit_scale.clamp(-LOGIT_SCALE_MAX, LOGIT_SCALE_MAX)?.exp()?;
        let mut attn = q
            .matmul(&k.transpose(D::Minus2, D::Minus1)?)?
            .broadcast_mul(&scale)?;
        attn = attn.broadcast_add(&self.position_bias()?)?;

        if let Some(mask) = mask {
            let nw = mask.dim(0)?;
            attn = attn
                .reshape((b / nw, nw, self.num_heads, n, n))?
                .broadcast_add(&mask.unsqueeze(1)?)?
                .reshape((b, self.num_heads, n, n))?;
        }

        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, c))?;
        self.proj.forward(&out)
    }
}

/// 对数间隔坐标: `sign(d) * log2(1 + |8d / (w-1)|) / log2(8)`.
fn log_spaced(d: f64, window: usize) -> f64 {
    let norm = 8.0 * d / (window - 1).max(1) as f64;
    norm.signum() * (1.0 + norm.abs()).log2() / 3.0
}

/// 两层 GELU MLP.
#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

/// 单个 transformer block.
#[derive(Debug)]
struct SwinBlock {
    attn: WindowAttention,
    mlp: Mlp,
    norm1: LayerNorm,
    norm2: LayerNorm,
    attn_mask: Option<Tensor>,
    resolution: (usize, usize),
    window: usize,
    shift: usize,
}

impl SwinBlock {
    fn new(
        dim: usize,
        num_heads: usize,
        resolution: (usize, usize),
        mut window: usize,
        mut shift: usize,
        mlp_ratio: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (h, w) = resolution;
        // 窗口覆盖整个特征图时退化为全局注意力, 平移没有意义.
        if window >= h.min(w) {
            window = h.min(w);
            shift = 0;
        }

        let attn = WindowAttention::new(dim, num_heads, window, vb.pp("attn"))?;
        let mlp = Mlp::new(dim, dim * mlp_ratio, vb.pp("mlp"))?;
        let norm1 = layer_norm(dim, 1e-5, vb.pp("norm1"))?;
        let norm2 = layer_norm(dim, 1e-5, vb.pp("norm2"))?;
        let attn_mask = if shift > 0 {
            Some(shift_mask(resolution, window, shift, vb.device())?)
        } else {
            None
        };

        Ok(Self {
            attn,
            mlp,
            norm1,
            norm2,
            attn_mask,
            resolution,
            window,
            shift,
        })
    }
}

impl Module for SwinBlock {
    /// `(B, H*W, C)` -> `(B, H*W, C)`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, c) = xs.dims3()?;
        let (h, w) = self.resolution;

        let mut y = xs.reshape((b, h, w, c))?;
        if self.shift > 0 {
            let s = self.shift as i64;
            y = roll(&roll(&y, 1, -s)?, 2, -s)?;
        }
        let windows = window_partition(&y, self.window)?;
        let attended = self.attn.forward(&windows, self.attn_mask.as_ref())?;
        let mut y = window_reverse(&attended, self.window, b, h, w)?;
        if self.shift > 0 {
            let s = self.shift as i64;
            y = roll(&roll(&y, 1, s)?, 2, s)?;
        }
        let y = y.reshape((b, h * w, c))?;

        // 后置归一化残差.
        let x = (xs + self.norm1.forward(&y)?)?;
        let m = self.norm2.forward(&self.mlp.forward(&x)?)?;
        x + m
    }
}

/// 平移窗口的加性注意力掩码 `(nW, n, n)`:
/// 同一连续区域内为 0, 跨区域为 -100.
fn shift_mask(
    (h, w): (usize, usize),
    window: usize,
    shift: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut region = vec![0f32; h * w];
    let spans = |len: usize| [(0, len - window), (len - window, len - shift), (len - shift, len)];
    let mut id = 0f32;
    for (hs, he) in spans(h) {
        for (ws, we) in spans(w) {
            for (i, j) in iproduct!(hs..he, ws..we) {
                region[i * w + j] = id;
            }
            id += 1.0;
        }
    }

    let n = window * window;
    let nw = (h / window) * (w / window);
    let mut mask = vec![0f32; nw * n * n];
    for (wi, wj) in iproduct!(0..h / window, 0..w / window) {
        let widx = wi * (w / window) + wj;
        // 当前窗口内各位置的区域编号.
        let ids: Vec<f32> = iproduct!(0..window, 0..window)
            .map(|(i, j)| region[(wi * window + i) * w + (wj * window + j)])
            .collect();
        for (a, b) in iproduct!(0..n, 0..n) {
            if ids[a] != ids[b] {
                mask[widx * n * n + a * n + b] = -100.0;
            }
        }
    }
    Tensor::from_vec(mask, (nw, n, n), device)
}

/// patch merging 下采样: 2x2 邻域拼接 + 线性降维 + LayerNorm.
#[derive(Debug)]
struct PatchMerging {
    reduction: Linear,
    norm: LayerNorm,
}

impl PatchMerging {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            reduction: linear(dim * 4, dim * 2, vb.pp("reduction"))?,
            norm: layer_norm(dim * 2, 1e-5, vb.pp("norm"))?,
        })
    }
}

impl Module for PatchMerging {
    /// `(B, H, W, C)` -> `(B, H/2, W/2, 2C)`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, h, w, c) = xs.dims4()?;
        let x = xs
            .reshape((b, h / 2, 2, w / 2, 2, c))?
            .permute((0, 1, 3, 2, 4, 5))?
            .contiguous()?
            .reshape((b, h / 2, w / 2, 4 * c))?;
        self.norm.forward(&self.reduction.forward(&x)?)
    }
}

/// 一个 stage: 可选 patch merging + 若干 block.
#[derive(Debug)]
struct SwinStage {
    downsample: Option<PatchMerging>,
    blocks: Vec<SwinBlock>,
    resolution: (usize, usize),
    dim: usize,
}

impl SwinStage {
    /// `(B, C, H, W)` -> `(B, C', H', W')`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let b = xs.dim(0)?;
        let mut y = xs.permute((0, 2, 3, 1))?.contiguous()?;
        if let Some(ds) = &self.downsample {
            y = ds.forward(&y)?;
        }
        let (h, w) = self.resolution;
        let mut t = y.reshape((b, h * w, self.dim))?;
        for blk in &self.blocks {
            t = blk.forward(&t)?;
        }
        t.reshape((b, h, w, self.dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }
}

/// 编码器输出的多分辨率特征金字塔 (均为 `(B, C, H, W)`).
#[derive(Debug)]
pub struct FeaturePyramid {
    /// patch embedding 输出.
    pub x1: Tensor,
    /// stage 1 输出 (与 `x1` 同分辨率).
    pub x2: Tensor,
    /// stage 2 输出.
    pub x3: Tensor,
    /// stage 3 输出.
    pub x4: Tensor,
    /// stage 4 输出 (最深层).
    pub x5: Tensor,
}

/// 共享编码器.
#[derive(Debug)]
pub struct SwinEncoder {
    patch_embed: PatchEmbed,
    stages: Vec<SwinStage>,
}

impl SwinEncoder {
    /// 按 `cfg` 构建编码器, 权重取自 `vb`.
    ///
    /// 如果 `img_size` 不能被 `patch_size` 与窗口逐级整除, 则 panic.
    pub fn new(cfg: &SwinConfig, vb: VarBuilder) -> Result<Self> {
        assert_eq!(
            cfg.img_size % cfg.patch_size,
            0,
            "patch 必须整除输入分辨率"
        );
        let patch_embed = PatchEmbed::new(cfg, vb.pp("patch_embed"))?;

        let mut res = cfg.img_size / cfg.patch_size;
        let mut dim = cfg.embed_dim;
        let mut stages = Vec::with_capacity(4);
        for s in 0..4 {
            let svb = vb.pp(format!("stages.{s}"));
            let downsample = if s == 0 {
                None
            } else {
                let ds = PatchMerging::new(dim, svb.pp("downsample"))?;
                dim *= 2;
                res /= 2;
                Some(ds)
            };

            let mut blocks = Vec::with_capacity(cfg.depths[s]);
            for i in 0..cfg.depths[s] {
                let shift = if i % 2 == 1 { cfg.window / 2 } else { 0 };
                blocks.push(SwinBlock::new(
                    dim,
                    cfg.num_heads[s],
                    (res, res),
                    cfg.window,
                    shift,
                    cfg.mlp_ratio,
                    svb.pp(format!("blocks.{i}")),
                )?);
            }
            stages.push(SwinStage {
                downsample,
                blocks,
                resolution: (res, res),
                dim,
            });
        }

        Ok(Self {
            patch_embed,
            stages,
        })
    }

    /// 前向计算, 返回五级特征金字塔.
    pub fn forward(&self, xs: &Tensor) -> Result<FeaturePyramid> {
        let x1 = self.patch_embed.forward(xs)?;
        let x2 = self.stages[0].forward(&x1)?;
        let x3 = self.stages[1].forward(&x2)?;
        let x4 = self.stages[2].forward(&x3)?;
        let x5 = self.stages[3].forward(&x4)?;
        Ok(FeaturePyramid { x1, x2, x3, x4, x5 })
    }
}
