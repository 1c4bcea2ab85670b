// ==========================================
// 飞行训练排班系统 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型,转换Repository错误为用户友好的错误消息
// 错误分级: 校验(400) / 越权(403) / 冲突(409) / 未找到(404) / 上游超时
// 红线: 同步入口必须带明确原因串;失效错误独立于一般冲突
// ==========================================

use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 校验错误 (400)
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    /// 改期请求已过失效时刻(独立于一般冲突,前端提示语不同)
    #[error("请求已失效: {0}")]
    RequestExpired(String),

    // ==========================================
    // 越权错误 (403)
    // ==========================================
    #[error("无权操作: {0}")]
    Forbidden(String),

    // ==========================================
    // 冲突错误 (409)
    // ==========================================
    #[error("状态冲突: {0}")]
    Conflict(String),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("重复开放请求: {0}")]
    DuplicateOpenRequest(String),

    // ==========================================
    // 未找到错误 (404)
    // ==========================================
    #[error("资源未找到: {0}")]
    NotFound(String),

    // ==========================================
    // 上游错误
    // ==========================================
    #[error("上游调用超时: {0}")]
    UpstreamTimeout(String),

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// HTTP 等价状态码(供外层 CRUD/API 壳直接映射)
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::InvalidInput(_) | ApiError::RequestExpired(_) => 400,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_)
            | ApiError::InvalidStateTransition { .. }
            | ApiError::DuplicateOpenRequest(_) => 409,
            ApiError::UpstreamTimeout(_) => 504,
            ApiError::DatabaseError(_) | ApiError::InternalError(_) | ApiError::Other(_) => 500,
        }
    }
}

// ==========================================
// 从 RepositoryError 转换
// 目的: 将Repository层的技术错误转换为用户友好的业务错误
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            // 并发控制错误 → 冲突(竞争失败方拿到确定性 409)
            RepositoryError::TransitionConflict {
                entity,
                id,
                expected,
            } => ApiError::Conflict(format!(
                "{}(id={}) 当前状态不满足期望前置状态 {}",
                entity, id, expected
            )),
            RepositoryError::DuplicateOpenRequest(flight_id) => {
                ApiError::DuplicateOpenRequest(format!("课程 {} 已存在未关闭的改期请求", flight_id))
            }
            RepositoryError::InvalidStateTransition { from, to } => {
                ApiError::InvalidStateTransition { from, to }
            }

            // 数据库错误
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseTransactionError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::Conflict(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::Conflict(format!("外键约束违反: {}", msg))
            }

            // 业务规则错误
            RepositoryError::BusinessRuleViolation(msg) => ApiError::Conflict(msg),
            RepositoryError::RescheduleChainViolation(msg) => ApiError::InvalidInput(msg),

            // 数据质量错误
            RepositoryError::ValidationError(msg) => ApiError::InvalidInput(msg),

            // 通用错误
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
            RepositoryError::Other(err) => ApiError::Other(err),
        }
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;
