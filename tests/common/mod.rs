#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use prodsearch::catalog::{Catalog, Upload};
use prodsearch::config::{BuildOptions, ConfDir};
use prodsearch::corpus::CorpusRecord;
use prodsearch::db::{Database, init_db};
use prodsearch::embedding::{EmbeddingProvider, EmbeddingVector, Modality};
use prodsearch::error::{Error, Result};
use tempfile::TempDir;

/// 按图片平均颜色生成向量的确定性实现
///
/// - visual: `[r, g, b] + 0.05`
/// - joint_image: `[r, g, b, 0.2]`
/// - joint_text: 文本中 red, green, blue 的出现次数，再加 0.2
#[derive(Default)]
pub struct ColorProvider {
    calls: AtomicUsize,
}

impl ColorProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn mean_rgb(image: &DynamicImage) -> [f32; 3] {
    let rgb = image.to_rgb8();
    let n = (rgb.width() * rgb.height()).max(1) as f32;
    let mut sum = [0f32; 3];
    for p in rgb.pixels() {
        for c in 0..3 {
            sum[c] += p[c] as f32 / 255.;
        }
    }
    sum.map(|s| s / n)
}

impl EmbeddingProvider for ColorProvider {
    fn dimension(&self, modality: Modality) -> usize {
        match modality {
            Modality::Visual => 3,
            Modality::JointImage | Modality::JointText => 4,
        }
    }

    fn embed_image(&self, space: Modality, image: &DynamicImage) -> Result<EmbeddingVector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let [r, g, b] = mean_rgb(image);
        match space {
            Modality::Visual => {
                EmbeddingVector::normalized(space, vec![r + 0.05, g + 0.05, b + 0.05])
            }
            Modality::JointImage => EmbeddingVector::normalized(space, vec![r, g, b, 0.2]),
            Modality::JointText => Err(Error::validation("joint_text 不是图片空间")),
        }
    }

    fn embed_text(&self, text: &str) -> Result<EmbeddingVector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = text.to_lowercase();
        let count = |word: &str| text.matches(word).count() as f32;
        EmbeddingVector::normalized(
            Modality::JointText,
            vec![count("red"), count("green"), count("blue"), 0.2],
        )
    }
}

pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb(color)));
    let mut buf = vec![];
    image.write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

pub fn upload(color: [u8; 3]) -> Upload {
    Upload {
        file_name: Some("image.png".to_string()),
        content_type: Some("image/png".to_string()),
        bytes: png_bytes(color),
    }
}

/// 一个临时的数据目录
pub struct Env {
    pub dir: TempDir,
    pub conf: ConfDir,
    pub db: Database,
    pub provider: Arc<ColorProvider>,
}

impl Env {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let conf = ConfDir::new(dir.path());
        let db = init_db(conf.database()).await.unwrap();
        std::fs::create_dir_all(conf.images()).unwrap();
        Self { dir, conf, db, provider: Arc::new(ColorProvider::default()) }
    }

    pub fn images(&self) -> PathBuf {
        self.conf.images()
    }

    pub async fn catalog(&self) -> Result<Catalog> {
        Catalog::open(&self.conf, self.images(), self.db.clone(), self.provider.clone()).await
    }

    /// 在图片目录下写入一张纯色图片，返回对应的语料记录
    pub fn image(&self, image_id: &str, item_id: &str, color: [u8; 3]) -> CorpusRecord {
        let image_path = format!("{image_id}.png");
        std::fs::write(self.images().join(&image_path), png_bytes(color)).unwrap();
        CorpusRecord { image_id: image_id.to_string(), item_id: item_id.to_string(), image_path }
    }

    /// 语料中指向不存在文件的记录
    pub fn missing(&self, image_id: &str, item_id: &str) -> CorpusRecord {
        CorpusRecord {
            image_id: image_id.to_string(),
            item_id: item_id.to_string(),
            image_path: "missing.png".to_string(),
        }
    }

    pub fn index_path(&self, modality: Modality) -> PathBuf {
        self.conf.index(modality)
    }
}

pub fn build_options(batch_size: usize) -> BuildOptions {
    BuildOptions { batch_size, workers: 2, queue_depth: 2, report: None, store: false }
}

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
