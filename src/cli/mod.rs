mod add;
mod build;
mod product;
mod search;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

pub use add::*;
pub use build::*;
pub use product::*;
pub use search::*;
pub use server::*;
use tokio::task::block_in_place;

use crate::catalog::Catalog;
use crate::config::{EmbedOptions, Opts};
use crate::db::{Database, init_db};
use crate::embedding::{EmbeddingProvider, FastEmbedProvider};

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

async fn open_db(opts: &Opts) -> anyhow::Result<Database> {
    Ok(init_db(opts.conf_dir.database()).await?)
}

fn load_provider(opts: &Opts, embed: &EmbedOptions) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let cache_dir = embed.model_dir.clone().unwrap_or_else(|| opts.conf_dir.models());
    let provider = block_in_place(|| FastEmbedProvider::new(cache_dir, true))?;
    Ok(Arc::new(provider))
}

fn images_root(opts: &Opts, embed: &EmbedOptions) -> PathBuf {
    embed.images.clone().unwrap_or_else(|| opts.conf_dir.images())
}

async fn open_catalog(
    opts: &Opts,
    embed: &EmbedOptions,
    db: Database,
    provider: Arc<dyn EmbeddingProvider>,
) -> anyhow::Result<Arc<Catalog>> {
    let catalog = Catalog::open(&opts.conf_dir, images_root(opts, embed), db, provider).await?;
    Ok(Arc::new(catalog))
}
