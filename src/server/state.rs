use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::SearchOptions;
use crate::search::SearchOrchestrator;

/// 应用状态
pub struct AppState {
    /// 商品目录，用于添加和查询商品
    pub catalog: Arc<Catalog>,
    pub orchestrator: SearchOrchestrator,
    /// 搜索配置选项
    pub search: SearchOptions,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        catalog: Arc<Catalog>,
        orchestrator: SearchOrchestrator,
        search: SearchOptions,
    ) -> Arc<Self> {
        Arc::new(AppState { catalog, orchestrator, search })
    }
}
