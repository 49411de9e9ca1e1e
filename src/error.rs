/// prodsearch 的错误类型
///
/// 前四类对应业务上的错误分类，其余为底层错误的透传
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 请求不合法，拒绝时不产生任何副作用
    #[error("参数错误: {0}")]
    Validation(String),

    /// 单条记录的特征提取失败，批量构建时会跳过该记录
    #[error("特征提取失败: {0}")]
    Extraction(String),

    #[error("未找到: {0}")]
    NotFound(String),

    /// 索引或账本的持久化失败
    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("请求已取消")]
    Cancelled,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("后台任务失败: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn extraction(msg: impl std::fmt::Display) -> Self {
        Self::Extraction(msg.to_string())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}
