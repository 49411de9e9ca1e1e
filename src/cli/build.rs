use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use log::info;

use crate::builder::{self, BuildReport, Builder};
use crate::cli::{SubCommandExtend, images_root, load_provider, open_catalog, open_db};
use crate::config::{BuildOptions, EmbedOptions, Opts};
use crate::corpus::{load_corpus, load_products};
use crate::db::Database;
use crate::embedding::{EmbeddingProvider, Modality};
use crate::store::PersistentStore;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    /// 纯视觉图片索引
    Visual,
    /// 联合空间图片索引
    JointImage,
    /// 商品描述文本索引
    JointText,
    /// 只导入商品数据
    Products,
}

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    #[command(flatten)]
    pub embed: EmbedOptions,
    #[command(flatten)]
    pub build: BuildOptions,
    /// 构建目标
    #[arg(value_enum)]
    pub target: BuildTarget,
    /// 图片语料，JSON 数组，每条记录包含 image_id, item_id, image_path
    #[arg(long, value_name = "FILE")]
    pub corpus: Option<PathBuf>,
    /// 商品数据，JSON 数组
    #[arg(long, value_name = "FILE")]
    pub products: Option<PathBuf>,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let db = open_db(opts).await?;

        let report = match self.target {
            BuildTarget::Products => {
                let Some(path) = &self.products else { bail!("导入商品需要 --products") };
                let count = builder::import_products(&db, load_products(path)?).await?;
                info!("导入商品成功: {count} 条");
                return Ok(());
            }
            BuildTarget::Visual => self.build_images(opts, db, Modality::Visual).await?,
            BuildTarget::JointImage => self.build_images(opts, db, Modality::JointImage).await?,
            BuildTarget::JointText => self.build_texts(opts, db).await?,
        };

        if let Some(path) = &self.build.report {
            report.write_json(path)?;
            info!("构建报告已写入: {}", path.display());
        }
        info!("构建索引成功");
        Ok(())
    }
}

impl BuildCommand {
    fn builder(&self, opts: &Opts, provider: Arc<dyn EmbeddingProvider>) -> Builder {
        Builder::new(provider, images_root(opts, &self.embed), self.build.clone()).progress(true)
    }

    async fn build_images(
        &self,
        opts: &Opts,
        db: Database,
        modality: Modality,
    ) -> Result<BuildReport> {
        let Some(path) = &self.corpus else { bail!("构建图片索引需要 --corpus") };
        let records = load_corpus(path)?;
        let provider = load_provider(opts, &self.embed)?;
        let builder = self.builder(opts, provider.clone());

        let report = if self.build.store {
            let store = PersistentStore::new(db);
            builder.build_store_images(&store, modality, records).await?
        } else {
            let catalog = open_catalog(opts, &self.embed, db, provider).await?;
            builder.build_images(&catalog, modality, records).await?
        };
        Ok(report)
    }

    async fn build_texts(&self, opts: &Opts, db: Database) -> Result<BuildReport> {
        let Some(path) = &self.products else { bail!("构建文本索引需要 --products") };
        let products = load_products(path)?;
        let provider = load_provider(opts, &self.embed)?;
        let builder = self.builder(opts, provider.clone());

        let report = if self.build.store {
            let store = PersistentStore::new(db);
            builder.build_store_texts(&store, products).await?
        } else {
            let catalog = open_catalog(opts, &self.embed, db, provider).await?;
            builder.build_texts(&catalog, products).await?
        };
        Ok(report)
    }
}
