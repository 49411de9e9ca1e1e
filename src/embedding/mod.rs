mod models;

use std::fmt;
use std::str::FromStr;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub use self::models::FastEmbedProvider;
use crate::error::{Error, Result};

/// 向量所属的嵌入空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Modality {
    /// 纯视觉空间，只能由图片生成
    Visual,
    /// 图文联合空间中的图片向量
    JointImage,
    /// 图文联合空间中的文本向量
    JointText,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Visual, Modality::JointImage, Modality::JointText];

    /// 由图片生成向量的模态，添加商品时每张图片都会写入这些索引
    pub const IMAGE: [Modality; 2] = [Modality::Visual, Modality::JointImage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::JointImage => "joint_image",
            Self::JointText => "joint_text",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, Self::JointText)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "visual" => Ok(Self::Visual),
            "joint_image" => Ok(Self::JointImage),
            "joint_text" => Ok(Self::JointText),
            _ => Err(Error::validation(format!("未知的模态: {s}"))),
        }
    }
}

/// L2 归一化后的向量
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    modality: Modality,
    values: Vec<f32>,
}

impl EmbeddingVector {
    /// 归一化并包装一个原始向量，零向量无法归一化，视为提取失败
    pub fn normalized(modality: Modality, mut values: Vec<f32>) -> Result<Self> {
        let norm = l2_norm(&values);
        if values.is_empty() || norm <= f32::EPSILON || !norm.is_finite() {
            return Err(Error::extraction(format!("{modality} 向量无法归一化")));
        }
        values.iter_mut().for_each(|v| *v /= norm);
        Ok(Self { modality, values })
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }
}

/// 向量提供者，把图片或文本映射到固定维度的归一化向量
///
/// 实现必须是确定性的：同一模型版本对同一输入总是返回相同的向量。
/// 调用方可能在多个线程中同时调用。
pub trait EmbeddingProvider: Send + Sync {
    /// 指定模态的向量维度
    fn dimension(&self, modality: Modality) -> usize;

    /// 在 `space` 空间中为图片生成向量，`space` 只能是图片模态
    fn embed_image(&self, space: Modality, image: &DynamicImage) -> Result<EmbeddingVector>;

    /// 在联合空间中为文本生成向量
    fn embed_text(&self, text: &str) -> Result<EmbeddingVector>;
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// 余弦相似度，任一向量为零向量时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = l2_norm(a) * l2_norm(b);
    if denom <= f32::EPSILON {
        return 0.;
    }
    inner_product(a, b) / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized() {
        let v = EmbeddingVector::normalized(Modality::Visual, vec![3., 4.]).unwrap();
        assert_eq!(v.as_slice(), &[0.6, 0.8]);
        assert!((l2_norm(v.as_slice()) - 1.).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero() {
        let r = EmbeddingVector::normalized(Modality::JointText, vec![0., 0.]);
        assert!(matches!(r, Err(Error::Extraction(_))));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1., 0.], &[2., 0.]) - 1.).abs() < 1e-6);
        assert!(cosine_similarity(&[1., 0.], &[0., 3.]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0., 0.], &[1., 0.]), 0.);
    }

    #[test]
    fn test_modality_roundtrip() {
        for m in Modality::ALL {
            assert_eq!(m.as_str().parse::<Modality>().unwrap(), m);
        }
        assert!("clip".parse::<Modality>().is_err());
    }
}
