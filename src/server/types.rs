use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use serde::Serialize;
use utoipa::ToSchema;

use crate::catalog::Upload;
use crate::search::SearchResults;

/// 返回结果数量的上限
pub const MAX_TOP_K: usize = 50;

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    #[form_data(limit = "10MiB")]
    pub file: FieldData<Bytes>,
    pub method: Option<String>,
    pub top_k: Option<usize>,
    pub text: Option<String>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 上传的图片文件
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 搜索方法：visual (cnn), joint (clip), fused (clip_text)
    #[schema(default = "visual")]
    pub method: Option<String>,
    /// 返回的结果数量，范围 1 到 50
    #[schema(default = 5, minimum = 1, maximum = 50)]
    pub top_k: Option<usize>,
    /// 融合搜索使用的描述文本
    pub text: Option<String>,
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u32,
    pub results: SearchResults,
}

/// 添加商品请求参数
#[derive(TryFromMultipart)]
pub struct AddProductRequest {
    pub item_id: String,
    pub product_type: String,
    pub item_name: String,
    #[form_data(limit = "10MiB")]
    pub main_image: FieldData<Bytes>,
    #[form_data(limit = "10MiB")]
    pub other_images: Vec<FieldData<Bytes>>,
}

/// 添加商品表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct AddProductForm {
    pub item_id: String,
    pub product_type: String,
    /// 商品名称，可以是 JSON 数组、JSON 对象或者英文名称
    pub item_name: String,
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub main_image: String,
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub other_images: Vec<String>,
}

/// 添加商品响应
#[derive(Debug, Serialize, ToSchema)]
pub struct AddProductResponse {
    pub item_id: String,
    pub main_image_id: String,
    pub other_image_id: Vec<String>,
}

pub fn into_upload(field: FieldData<Bytes>) -> Upload {
    Upload {
        file_name: field.metadata.file_name,
        content_type: field.metadata.content_type,
        bytes: field.contents.to_vec(),
    }
}
