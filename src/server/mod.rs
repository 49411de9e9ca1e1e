mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::error::AppError;
pub use self::state::*;
pub use self::types::MAX_TOP_K;

#[derive(OpenApi)]
#[openapi(
    paths(api::search_handler, api::add_product_handler, api::product_handler),
    components(schemas(
        types::SearchForm,
        types::SearchResponse,
        types::AddProductForm,
        types::AddProductResponse,
        crate::search::SearchResults,
        crate::search::SearchHit,
        crate::search::FusedHit,
        crate::db::ProductView,
        crate::db::ImageRef,
        crate::corpus::ItemName,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/search", post(api::search_handler))
        .route("/add_product", post(api::add_product_handler))
        .route("/products/{item_id}", get(api::product_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：10M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
        .with_state(state)
}
