use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::corpus::ItemName;
use crate::embedding::Modality;
use crate::index::Position;

/// 图片向量的元数据，position 和索引中的偏移量一一对应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MetadataRecord {
    pub modality: Modality,
    pub position: Position,
    pub image_id: String,
    pub item_id: String,
    pub image_path: String,
}

/// 商品描述文本向量的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ItemTextRecord {
    pub position: Position,
    pub item_id: String,
    pub metadata_text: String,
}

/// 已发布的索引状态
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct IndexState {
    pub modality: Modality,
    pub count: i64,
    /// 索引文件的 blake3 校验和
    pub checksum: String,
}

/// 商品记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub item_id: String,
    #[sqlx(json)]
    pub product_type: Vec<String>,
    #[sqlx(json)]
    pub item_name: Vec<ItemName>,
    pub main_image_id: String,
    #[sqlx(json)]
    pub other_image_id: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ImageRef {
    pub image_id: String,
    /// 找不到图片时为空字符串
    pub image_path: String,
}

/// 返回给调用方的商品详情，图片 ID 已经解析成路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProductView {
    pub item_id: String,
    pub product_type: Vec<String>,
    pub item_name: Vec<ItemName>,
    pub main_image: ImageRef,
    pub other_images: Vec<ImageRef>,
}
