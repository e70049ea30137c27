//! 命令行分割入口: 读取一个 nifti 体数据, 写出四个预测 mask.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::LevelFilter;

use pkdia::probe::{self, RuntimeSupport};
use pkdia::{segment, Modality};

#[derive(Parser, Debug)]
#[command(version, about = "多囊肾左右肾自动分割")]
struct Cli {
    /// 输入体数据文件 (.nii / .nii.gz).
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 输出目录. 不存在时自动创建.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// 成像模态.
    #[arg(short, long, value_enum)]
    modality: Option<ModalityArg>,

    /// 权重文件路径. 缺省时从默认权重目录按模态解析.
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// 只探测运行环境 (加速器/权重在位情况) 并退出.
    #[arg(long)]
    probe: bool,

    /// 打印逐切片调试日志.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModalityArg {
    /// MRI T2 加权序列.
    T2,
    /// CT 扫描.
    Ct,
}

impl From<ModalityArg> for Modality {
    fn from(m: ModalityArg) -> Self {
        match m {
            ModalityArg::T2 => Modality::T2,
            ModalityArg::Ct => Modality::Ct,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .unwrap();

    if cli.probe {
        print!("{}", RuntimeSupport::probe());
        return ExitCode::SUCCESS;
    }

    let (Some(input), Some(output_dir), Some(modality)) =
        (cli.input, cli.output_dir, cli.modality)
    else {
        eprintln!("缺少参数: 需要 --input, --output-dir 与 --modality (或使用 --probe)");
        return ExitCode::FAILURE;
    };
    let modality = Modality::from(modality);

    let weights = match probe::require_weights(modality, cli.weights.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match segment(&input, &output_dir, modality, &weights) {
        Ok(pred) => {
            println!("{}", pred.left_kidney.display());
            println!("{}", pred.right_kidney.display());
            println!("{}", pred.combined.display());
            println!("{}", pred.combined_nopp.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("分割失败: {e}");
            ExitCode::FAILURE
        }
    }
}
