//! リクエストボディの検証
//!
//! axum の `Json` 抽出器は独自のエラー応答を返すため、ヘッダーとボディを
//! 自前で検証して `{error, error_code}` 形式に揃える。

use crate::error::{ManagerError, Result};
use axum::http::HeaderMap;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use harpoon_core::HarpoonError;
use serde_json::Value;

/// `POST /start_container`
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub image: String,
    /// (ホストポート, コンテナポート)。ホストポート 0 は空きポートを割り当てる
    pub ports: Vec<(u16, u16)>,
}

/// `POST /stop_container`
#[derive(Debug, Clone, PartialEq)]
pub struct StopRequest {
    pub image: String,
}

impl StartRequest {
    pub fn parse(headers: &HeaderMap, body: &[u8]) -> Result<Self> {
        let body = json_body(headers, body)?;
        let image = image_field(&body)?;

        let ports = match body.get("ports") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| port_pair(item, i))
                .collect::<Result<_>>()?,
            Some(_) => {
                return Err(HarpoonError::bad_value("<request>.ports", "ports must be a list").into());
            }
        };

        Ok(Self { image, ports })
    }
}

impl StopRequest {
    pub fn parse(headers: &HeaderMap, body: &[u8]) -> Result<Self> {
        let body = json_body(headers, body)?;
        Ok(Self {
            image: image_field(&body)?,
        })
    }
}

fn json_body(headers: &HeaderMap, body: &[u8]) -> Result<Value> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Err(ManagerError::bad_request(format!(
            "Content-Type must be application/json, got '{}'",
            content_type
        )));
    }

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared == Some(0) || body.is_empty() {
        return Err(ManagerError::bad_request("request body is empty"));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ManagerError::bad_request(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(ManagerError::bad_request("request body must be a JSON object"));
    }
    Ok(value)
}

fn image_field(body: &Value) -> Result<String> {
    match body.get("image") {
        Some(Value::String(image)) if !image.is_empty() => Ok(image.clone()),
        Some(_) => Err(HarpoonError::bad_value("<request>.image", "image must be a non-empty string").into()),
        None => Err(HarpoonError::bad_value("<request>.image", "image is required").into()),
    }
}

fn port_pair(item: &Value, index: usize) -> Result<(u16, u16)> {
    let path = format!("<request>.ports[{}]", index);
    let pair = item
        .as_array()
        .filter(|pair| pair.len() == 2)
        .ok_or_else(|| HarpoonError::bad_value(&path, "expected [host_port, container_port]"))?;

    let port = |value: &Value| {
        value
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| HarpoonError::bad_value(&path, format!("invalid port: {}", value)))
    };
    let host = port(&pair[0])?;
    let container = port(&pair[1])?;
    if container == 0 {
        return Err(HarpoonError::bad_value(&path, "container port must not be 0").into());
    }
    Ok((host, container))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use harpoon_core::ErrorDetails;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_parse_start_request() {
        let request =
            StartRequest::parse(&json_headers(), br#"{"image": "py", "ports": [[0, 4545], [8080, 80]]}"#)
                .unwrap();
        assert_eq!(request.image, "py");
        assert_eq!(request.ports, vec![(0, 4545), (8080, 80)]);

        let request = StartRequest::parse(&json_headers(), br#"{"image": "py"}"#).unwrap();
        assert!(request.ports.is_empty());
    }

    #[test]
    fn test_missing_image_is_bad_value() {
        let err = StartRequest::parse(&json_headers(), br#"{"ports": [[0, 1]]}"#).unwrap_err();
        assert_eq!(err.error_code(), "BadSpecValue");
        assert_eq!(err.details()["meta"], "<request>.image");
    }

    #[test]
    fn test_malformed_requests() {
        assert_eq!(
            StartRequest::parse(&HeaderMap::new(), br#"{"image": "py"}"#)
                .unwrap_err()
                .error_code(),
            "BadRequest"
        );
        assert_eq!(
            StartRequest::parse(&json_headers(), b"").unwrap_err().error_code(),
            "BadRequest"
        );
        assert_eq!(
            StartRequest::parse(&json_headers(), b"{not json").unwrap_err().error_code(),
            "BadRequest"
        );
        assert_eq!(
            StartRequest::parse(&json_headers(), br#"{"image": "py", "ports": [[70000, 1]]}"#)
                .unwrap_err()
                .error_code(),
            "BadSpecValue"
        );
        assert_eq!(
            StartRequest::parse(&json_headers(), br#"{"image": "py", "ports": [[1]]}"#)
                .unwrap_err()
                .error_code(),
            "BadSpecValue"
        );
    }

    #[test]
    fn test_parse_stop_request() {
        let request = StopRequest::parse(&json_headers(), br#"{"image": "py"}"#).unwrap();
        assert_eq!(request.image, "py");
    }
}
