use anyhow::Result;
use clap::Parser;

use crate::catalog::product_view;
use crate::cli::{SubCommandExtend, open_db};
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ProductCommand {
    /// 商品 ID
    pub item_id: String,
}

impl SubCommandExtend for ProductCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let db = open_db(opts).await?;
        let product = product_view(&db, &self.item_id).await?;
        println!("{}", serde_json::to_string_pretty(&product)?);
        Ok(())
    }
}
