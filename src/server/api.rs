use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum_typed_multipart::TypedMultipart;
use log::info;
use tokio::task::spawn_blocking;

use super::error::Result;
use super::state::AppState;
use super::types::*;
use crate::cancel::CancellationToken;
use crate::catalog::NewProduct;
use crate::corpus::parse_item_names;
use crate::db::ProductView;
use crate::error::Error;
use crate::search::SearchMethod;
use crate::utils::decode_image;

/// 以图搜商品
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "参数错误或者图片无法解码"),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let method = data.method.as_deref().unwrap_or("visual").parse::<SearchMethod>()?;
    let top_k = data.top_k.unwrap_or(state.search.top_k);
    if !(1..=MAX_TOP_K).contains(&top_k) {
        return Err(Error::validation(format!("top_k 必须在 1 到 {MAX_TOP_K} 之间")).into());
    }
    let is_image =
        data.file.metadata.content_type.as_deref().is_some_and(|t| t.starts_with("image/"));
    if !is_image {
        return Err(Error::validation("上传的文件不是图片").into());
    }

    info!("正在搜索上传图片: {method}, top_k = {top_k}");

    let cancel = CancellationToken::new();
    let start = Instant::now();

    let bytes = data.file.contents;
    let text = data.text;
    let results = cancel_on_drop(&cancel, async {
        let image = spawn_blocking(move || decode_image(&bytes)).await??;
        let results =
            state.orchestrator.search_image(method, image, text.as_deref(), top_k, &cancel).await?;
        Ok::<_, Error>(results)
    })
    .await?;

    Ok(Json(SearchResponse { time: start.elapsed().as_millis() as u32, results }))
}

/// 运行 `fut`，客户端断开导致 future 被丢弃时取消 `cancel`，后台的阻塞搜索随之停止
async fn cancel_on_drop<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> T {
    let guard = cancel.clone().drop_guard();
    let output = fut.await;
    guard.disarm();
    output
}

/// 添加商品及其图片
#[utoipa::path(
    post,
    path = "/add_product",
    request_body(content = AddProductForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = AddProductResponse),
        (status = 400, description = "商品已存在或者上传的文件不是图片"),
    )
)]
pub async fn add_product_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<AddProductRequest>,
) -> Result<Json<AddProductResponse>> {
    let product_type = data.product_type.trim();
    let request = NewProduct {
        item_id: data.item_id,
        product_type: if product_type.is_empty() { vec![] } else { vec![product_type.to_string()] },
        item_name: parse_item_names(&data.item_name),
        main_image: into_upload(data.main_image),
        other_images: data.other_images.into_iter().map(into_upload).collect(),
    };

    let product = state.catalog.add_product(request).await?;
    Ok(Json(AddProductResponse {
        item_id: product.item_id,
        main_image_id: product.main_image_id,
        other_image_id: product.other_image_id,
    }))
}

/// 查询商品详情
#[utoipa::path(
    get,
    path = "/products/{item_id}",
    params(("item_id" = String, Path, description = "商品 ID")),
    responses(
        (status = 200, body = ProductView),
        (status = 404, description = "商品不存在"),
    )
)]
pub async fn product_handler(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<ProductView>> {
    Ok(Json(state.catalog.product(&item_id).await?))
}
