//! 字符串服务的请求 / 响应结构（服务端与代理共用的 JSON 格式）

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UppercaseRequest {
    pub s: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UppercaseResponse {
    pub v: String,
    /// 业务错误，成功时不输出
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRequest {
    pub s: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResponse {
    pub v: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uppercase_response_omits_empty_err() {
        let ok = UppercaseResponse {
            v: "HI".to_string(),
            err: None,
        };
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"v":"HI"}"#);

        let decoded: UppercaseResponse =
            serde_json::from_str(r#"{"v":"","err":"empty string"}"#).unwrap();
        assert_eq!(decoded.err.as_deref(), Some("empty string"));
    }
}
