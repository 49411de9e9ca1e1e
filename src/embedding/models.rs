use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

use ::fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use image::{DynamicImage, ImageFormat, RgbImage};
use log::info;

use super::{EmbeddingProvider, EmbeddingVector, Modality};
use crate::error::{Error, Result};

/// 基于 fastembed 的向量提供者
///
/// - 视觉空间：ResNet-50
/// - 联合空间：CLIP ViT-B/32 的图片和文本编码器
///
/// fastembed 的 embed 需要可变引用，所以每个模型各自包一层 Mutex
pub struct FastEmbedProvider {
    visual: Mutex<ImageEmbedding>,
    joint_image: Mutex<ImageEmbedding>,
    joint_text: Mutex<TextEmbedding>,
    dims: [usize; 3],
}

impl FastEmbedProvider {
    /// 加载模型，首次使用时会下载到 `cache_dir`
    pub fn new(cache_dir: PathBuf, show_progress: bool) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        info!("加载向量模型: {}", cache_dir.display());

        let mut visual = ImageEmbedding::try_new(
            ImageInitOptions::new(ImageEmbeddingModel::Resnet50)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(show_progress),
        )
        .map_err(init_failed)?;
        let mut joint_image = ImageEmbedding::try_new(
            ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(show_progress),
        )
        .map_err(init_failed)?;
        let mut joint_text = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::ClipVitB32)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(show_progress),
        )
        .map_err(init_failed)?;

        // 用一张空白图片和一段文本探测维度
        let probe = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(32, 32)))?;
        let dims = [
            probe_image(&mut visual, &probe)?,
            probe_image(&mut joint_image, &probe)?,
            joint_text
                .embed(vec!["probe"], None)
                .map_err(init_failed)?
                .first()
                .map(|v| v.len())
                .ok_or_else(|| Error::extraction("文本模型没有返回向量"))?,
        ];
        info!("向量维度: visual={}, joint_image={}, joint_text={}", dims[0], dims[1], dims[2]);

        Ok(Self {
            visual: Mutex::new(visual),
            joint_image: Mutex::new(joint_image),
            joint_text: Mutex::new(joint_text),
            dims,
        })
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn dimension(&self, modality: Modality) -> usize {
        match modality {
            Modality::Visual => self.dims[0],
            Modality::JointImage => self.dims[1],
            Modality::JointText => self.dims[2],
        }
    }

    fn embed_image(&self, space: Modality, image: &DynamicImage) -> Result<EmbeddingVector> {
        let model = match space {
            Modality::Visual => &self.visual,
            Modality::JointImage => &self.joint_image,
            Modality::JointText => {
                return Err(Error::validation("joint_text 不是图片空间"));
            }
        };
        let bytes = encode_png(image)?;
        let mut model = model.lock().map_err(|e| Error::extraction(format!("模型锁失效: {e}")))?;
        let mut embeddings =
            model.embed_bytes(&[bytes.as_slice()], None).map_err(Error::extraction)?;
        let values = embeddings.pop().ok_or_else(|| Error::extraction("图片模型没有返回向量"))?;
        EmbeddingVector::normalized(space, values)
    }

    fn embed_text(&self, text: &str) -> Result<EmbeddingVector> {
        let mut model =
            self.joint_text.lock().map_err(|e| Error::extraction(format!("模型锁失效: {e}")))?;
        let mut embeddings = model.embed(vec![text], None).map_err(Error::extraction)?;
        let values = embeddings.pop().ok_or_else(|| Error::extraction("文本模型没有返回向量"))?;
        EmbeddingVector::normalized(Modality::JointText, values)
    }
}

fn init_failed(e: impl std::fmt::Display) -> Error {
    Error::Extraction(format!("模型初始化失败: {e}"))
}

fn probe_image(model: &mut ImageEmbedding, probe: &[u8]) -> Result<usize> {
    model
        .embed_bytes(&[probe], None)
        .map_err(init_failed)?
        .first()
        .map(|v| v.len())
        .ok_or_else(|| Error::extraction("图片模型没有返回向量"))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).map_err(Error::extraction)?;
    Ok(buf)
}
