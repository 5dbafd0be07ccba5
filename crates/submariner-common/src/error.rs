//! 错误处理模块
//!
//! 该模块提供 Submariner Addon 的统一错误类型。与 Kubernetes API 交互产生的错误
//! 会被归类为冲突、不存在、已存在等语义，供协调循环决定是重试、忽略还是放弃。

use thiserror::Error;

/// Submariner Addon 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 乐观并发冲突（resourceVersion 不匹配）
    #[error("资源版本冲突: {0}")]
    Conflict(String),

    /// 资源不存在
    #[error("资源不存在: {0}")]
    NotFound(String),

    /// 资源已存在
    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    /// 其他 Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[source] kube::Error),

    /// 模板资源不存在
    #[error("模板资源不存在: {0}")]
    AssetNotFound(String),

    /// 模板渲染错误
    #[error("模板渲染错误 ({asset}): {message}")]
    Template { asset: String, message: String },

    /// 渲染结果解码错误
    #[error("清单解码错误 ({asset}): {message}")]
    Decode { asset: String, message: String },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 资源内容不合法
    #[error("资源内容不合法: {0}")]
    InvalidObject(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 多个资源操作失败的聚合错误
    #[error("{} 个操作失败: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

/// Submariner Addon 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            _ => Error::Kube(err),
        }
    }
}

impl Error {
    /// 是否为乐观并发冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// 是否为资源不存在
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// 是否为资源已存在
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// 是否为不可通过重试恢复的错误（构建期契约被破坏）
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::AssetNotFound(_) | Error::Template { .. } | Error::Decode { .. } => true,
            Error::Aggregate(errors) => errors.iter().all(Error::is_permanent),
            _ => false,
        }
    }

    /// 将多个错误合并为一个；没有错误时返回 `Ok(())`
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

/// 将 "不存在" 视为成功，用于幂等删除
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_error_classification() {
        assert!(Error::from(api_error(409, "Conflict")).is_conflict());
        assert!(Error::from(api_error(409, "AlreadyExists")).is_already_exists());
        assert!(Error::from(api_error(404, "NotFound")).is_not_found());

        let other = Error::from(api_error(500, "InternalError"));
        assert!(matches!(other, Error::Kube(_)));
        assert!(!other.is_permanent());
    }

    #[test]
    fn test_aggregate() {
        assert!(Error::aggregate(vec![]).is_ok());

        let single = Error::aggregate(vec![Error::Config("a".into())]).unwrap_err();
        assert!(matches!(single, Error::Config(_)));

        let many = Error::aggregate(vec![
            Error::Config("a".into()),
            Error::InvalidObject("b".into()),
        ])
        .unwrap_err();
        assert!(many.to_string().starts_with("2 个操作失败"));
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(Error::NotFound("x".into()))).is_ok());
        assert!(ignore_not_found(Err(Error::Conflict("x".into()))).is_err());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(Error::AssetNotFound("manifests/x.yaml".into()).is_permanent());
        assert!(Error::Template {
            asset: "a".into(),
            message: "undefined".into()
        }
        .is_permanent());
        assert!(!Error::Conflict("x".into()).is_permanent());
    }
}
