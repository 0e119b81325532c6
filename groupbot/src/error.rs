use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to parse the url")]
    UrlParseError(#[from] url::ParseError),
    #[error("request not complete")]
    ReqwestError(#[from] reqwest::Error),
    #[error("database failure")]
    MongoError(#[from] mongodb::error::Error),
    #[error("failed to serialize document")]
    BsonSerError(#[from] mongodb::bson::ser::Error),
    #[error("failed to deserialize document")]
    BsonDeError(#[from] mongodb::bson::de::Error),
    #[error("error when sending telegram message")]
    TeloxideRequestError(#[from] teloxide::RequestError),
    #[error("dialogue storage error")]
    DialogueError(#[from] teloxide::dispatching::dialogue::InMemStorageError),
    #[error("failed to parse json")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("failed to parse time")]
    ParseError(#[from] chrono::ParseError),
    #[error("cannot parse number to int")]
    ParseIntError(#[from] std::num::ParseIntError),
    #[error("regex error")]
    RegexError(#[from] regex::Error),
    #[error("cron error")]
    CronError(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("addr parse error")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("hyper error")]
    HyperError(#[from] hyper::Error),
    #[error("IO Error")]
    IOError(#[from] std::io::Error),
    #[error("serde_yaml Error")]
    SerdeYamlError(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid keyword: {0}")]
    InvalidKeyword(String),
    #[error("invalid broadcast: {0}")]
    InvalidBroadcast(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("group {0} is not authorised")]
    UnknownGroup(i64),
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl Error {
    /// Text that can be shown to a chat user as is.
    ///
    /// Infrastructure failures are hidden behind a generic message.
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidKeyword(reason)
            | Error::InvalidBroadcast(reason)
            | Error::InvalidInput(reason)
            | Error::InvalidConfig(reason) => format!("❌ {reason}"),
            Error::PermissionDenied => "❌ 权限不足".to_string(),
            Error::UnknownGroup(id) => format!("❌ 群组 {id} 未授权"),
            Error::NotFound(what) => format!("❌ 未找到{what}"),
            _ => "❌ 操作失败，请稍后重试".to_string(),
        }
    }

    /// Failures on our side, as opposed to rejected input or permissions.
    pub fn is_internal(&self) -> bool {
        !matches!(
            self,
            Error::InvalidKeyword(_)
                | Error::InvalidBroadcast(_)
                | Error::InvalidInput(_)
                | Error::InvalidConfig(_)
                | Error::PermissionDenied
                | Error::UnknownGroup(_)
                | Error::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message() {
        assert_eq!(
            Error::InvalidKeyword("关键词不能为空".into()).user_message(),
            "❌ 关键词不能为空"
        );
        assert_eq!(Error::PermissionDenied.user_message(), "❌ 权限不足");
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.user_message(), "❌ 操作失败，请稍后重试");
        assert!(io.is_internal());
        assert!(!Error::UnknownGroup(-1).is_internal());
    }
}
