use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::catalog::{NewProduct, Upload};
use crate::cli::{SubCommandExtend, load_provider, open_catalog, open_db};
use crate::config::{EmbedOptions, Opts};
use crate::corpus::parse_item_names;

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub embed: EmbedOptions,
    /// 商品 ID，不能和已有商品重复
    #[arg(long)]
    pub item_id: String,
    /// 商品类型，可以指定多次
    #[arg(long)]
    pub product_type: Vec<String>,
    /// 商品名称，可以是 JSON 数组、JSON 对象或者英文名称
    #[arg(long, default_value = "")]
    pub item_name: String,
    /// 商品主图
    pub main_image: PathBuf,
    /// 商品的其他图片
    pub other_images: Vec<PathBuf>,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let main_image = read_upload(&self.main_image).await?;
        let mut other_images = vec![];
        for path in &self.other_images {
            other_images.push(read_upload(path).await?);
        }
        let item_name =
            if self.item_name.is_empty() { vec![] } else { parse_item_names(&self.item_name) };

        let db = open_db(opts).await?;
        let provider = load_provider(opts, &self.embed)?;
        let catalog = open_catalog(opts, &self.embed, db, provider).await?;

        let product = catalog
            .add_product(NewProduct {
                item_id: self.item_id.clone(),
                product_type: self.product_type.clone(),
                item_name,
                main_image,
                other_images,
            })
            .await?;
        info!("添加商品成功: {}", product.item_id);
        println!("{}", serde_json::to_string_pretty(&product)?);
        Ok(())
    }
}

/// 读取本地图片，按文件头推断 MIME 类型
async fn read_upload(path: &Path) -> Result<Upload> {
    let bytes = tokio::fs::read(path).await?;
    let content_type = image::guess_format(&bytes).ok().map(|f| f.to_mime_type().to_string());
    Ok(Upload {
        file_name: path.file_name().map(|s| s.to_string_lossy().to_string()),
        content_type,
        bytes,
    })
}
