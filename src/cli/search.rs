use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::task::spawn_blocking;

use crate::cancel::CancellationToken;
use crate::cli::{SubCommandExtend, load_provider, open_catalog, open_db};
use crate::config::{EmbedOptions, Opts, SearchOptions};
use crate::search::{Backend, FusionWeights, SearchMethod, SearchOrchestrator, SearchResults};
use crate::store::PersistentStore;
use crate::utils::decode_image;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub embed: EmbedOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 搜索方法：visual (cnn), joint (clip), fused (clip_text)
    #[arg(short, long, default_value = "visual")]
    pub method: String,
    /// 融合搜索使用的描述文本
    #[arg(short, long)]
    pub text: Option<String>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let method = self.method.parse::<SearchMethod>()?;
        let bytes = tokio::fs::read(&self.image).await?;
        let image = spawn_blocking(move || decode_image(&bytes)).await??;

        let db = open_db(opts).await?;
        let provider = load_provider(opts, &self.embed)?;
        let backend = if self.search.store {
            Backend::Store(Arc::new(PersistentStore::new(db)))
        } else {
            Backend::Index(open_catalog(opts, &self.embed, db, provider.clone()).await?)
        };
        let orchestrator = SearchOrchestrator::new(backend, provider)
            .candidates(self.search.candidates)
            .weights(FusionWeights {
                image: self.search.image_weight,
                text: self.search.text_weight,
            });

        let results = orchestrator
            .search_image(
                method,
                image,
                self.text.as_deref(),
                self.search.top_k,
                &CancellationToken::new(),
            )
            .await?;

        print_result(&results, self.output_format)
    }
}

fn print_result(results: &SearchResults, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?)
        }
        OutputFormat::Table => match results {
            SearchResults::Image(hits) => {
                for hit in hits {
                    println!("{:.4}\t{}\t{}", hit.score, hit.item_id, hit.image_path);
                }
            }
            SearchResults::Fused(hits) => {
                for hit in hits {
                    println!(
                        "{:.4}\t{:.4}\t{:.4}\t{}\t{}",
                        hit.combined_score,
                        hit.image_score,
                        hit.text_score,
                        hit.item_id,
                        hit.image_path
                    );
                }
            }
        },
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
