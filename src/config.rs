use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::embedding::Modality;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let path = ProjectDirs::from("", "prodsearch", "prodsearch")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".prodsearch"));
    ConfDir { path }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap_or(".prodsearch")
}

#[derive(Parser, Debug, Clone)]
pub struct EmbedOptions {
    /// 模型缓存目录，默认为配置目录下的 models
    #[arg(long, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,
    /// 商品图片根目录，默认为配置目录下的 images
    #[arg(long, value_name = "DIR")]
    pub images: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 返回的结果数量
    #[arg(short = 'k', long, value_name = "K", default_value_t = 5)]
    pub top_k: usize,
    /// 融合搜索时图片相似度的权重
    #[arg(long, value_name = "WEIGHT", default_value_t = 0.6)]
    pub image_weight: f32,
    /// 融合搜索时文本相似度的权重
    #[arg(long, value_name = "WEIGHT", default_value_t = 0.4)]
    pub text_weight: f32,
    /// 融合搜索时从图片索引中召回的候选数量
    #[arg(long, value_name = "K", default_value_t = 1000)]
    pub candidates: usize,
    /// 使用持久化集合而不是本地索引进行搜索
    #[arg(long)]
    pub store: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct BuildOptions {
    /// 多少条记录为一个批次
    #[arg(long, value_name = "SIZE", default_value_t = 1000)]
    pub batch_size: usize,
    /// 提取特征的线程数
    #[arg(long, value_name = "N", default_value_t = num_cpus::get())]
    pub workers: usize,
    /// 等待提取的记录队列长度
    #[arg(long, value_name = "N", default_value_t = 64)]
    pub queue_depth: usize,
    /// 构建报告的输出路径
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
    /// 写入持久化集合而不是本地索引
    #[arg(long)]
    pub store: bool,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "prodsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// prodsearch 数据目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 从语料构建索引
    Build(BuildCommand),
    /// 以图搜商品
    Search(SearchCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
    /// 添加一个商品及其图片
    Add(AddCommand),
    /// 查看商品详情
    Product(ProductCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("prodsearch.db")
    }

    /// 返回指定模态索引文件的路径
    pub fn index(&self, modality: Modality) -> PathBuf {
        self.path.join(format!("{modality}.index"))
    }

    /// 返回默认的图片根目录
    pub fn images(&self) -> PathBuf {
        self.path.join("images")
    }

    /// 返回默认的模型缓存目录
    pub fn models(&self) -> PathBuf {
        self.path.join("models")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}
