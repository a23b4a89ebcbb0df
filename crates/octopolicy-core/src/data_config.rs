//! Data refresh configuration attached to a policy.
//!
//! Stored as raw JSON text on the policy and parsed by the refresh scheduler:
//!
//! ```json
//! { "url": "https://example.com/data", "method": "POST", "period": "1h", "body": {"k": "v"} }
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// HTTP method used to fetch refreshed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMethod {
    Get,
    Post,
}

impl RefreshMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Error)]
pub enum DataConfigError {
    #[error("invalid data config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data config is missing `{0}`")]
    Missing(&'static str),

    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported method `{0}`")]
    UnsupportedMethod(String),

    #[error("invalid period `{period}`: {reason}")]
    InvalidPeriod { period: String, reason: String },
}

#[derive(Deserialize)]
struct RawDataConfig {
    url: Option<String>,
    method: Option<String>,
    period: Option<String>,
    body: Option<serde_json::Value>,
}

/// Parsed, validated data refresh configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DataConfig {
    pub url: Url,
    pub method: RefreshMethod,
    pub period: Duration,
    /// JSON body sent with `POST` requests.
    pub body: Option<serde_json::Value>,
}

impl DataConfig {
    pub fn parse(raw: &str) -> Result<Self, DataConfigError> {
        let raw: RawDataConfig = serde_json::from_str(raw)?;

        let url = raw
            .url
            .filter(|u| !u.is_empty())
            .ok_or(DataConfigError::Missing("url"))?;
        let method = raw
            .method
            .filter(|m| !m.is_empty())
            .ok_or(DataConfigError::Missing("method"))?;
        let period = raw
            .period
            .filter(|p| !p.is_empty())
            .ok_or(DataConfigError::Missing("period"))?;

        let url = Url::parse(&url).map_err(|e| DataConfigError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let method = match method.to_ascii_uppercase().as_str() {
            "GET" => RefreshMethod::Get,
            "POST" => RefreshMethod::Post,
            _ => return Err(DataConfigError::UnsupportedMethod(method)),
        };

        let period = humantime::parse_duration(&period).map_err(|e| {
            DataConfigError::InvalidPeriod {
                period: period.clone(),
                reason: e.to_string(),
            }
        })?;
        if period.is_zero() {
            return Err(DataConfigError::InvalidPeriod {
                period: "0".into(),
                reason: "period must be positive".into(),
            });
        }

        Ok(Self {
            url,
            method,
            period,
            body: raw.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let cfg = DataConfig::parse(r#"{"url":"https://x","method":"GET","period":"1h"}"#).unwrap();
        assert_eq!(cfg.url.as_str(), "https://x/");
        assert_eq!(cfg.method, RefreshMethod::Get);
        assert_eq!(cfg.period, Duration::from_secs(3600));
        assert!(cfg.body.is_none());
    }

    #[test]
    fn test_parse_post_with_body() {
        let cfg = DataConfig::parse(
            r#"{"url":"http://localhost:8080/data","method":"post","period":"30m","body":{"a":1}}"#,
        )
        .unwrap();
        assert_eq!(cfg.method, RefreshMethod::Post);
        assert_eq!(cfg.period, Duration::from_secs(1800));
        assert_eq!(cfg.body, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_empty_object_is_missing_url() {
        let err = DataConfig::parse("{}").unwrap_err();
        assert!(matches!(err, DataConfigError::Missing("url")));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            DataConfig::parse("not json"),
            Err(DataConfigError::Json(_))
        ));
        assert!(matches!(
            DataConfig::parse(r#"{"url":"https://x","period":"1h"}"#),
            Err(DataConfigError::Missing("method"))
        ));
        assert!(matches!(
            DataConfig::parse(r#"{"url":"https://x","method":"PUT","period":"1h"}"#),
            Err(DataConfigError::UnsupportedMethod(_))
        ));
        assert!(matches!(
            DataConfig::parse(r#"{"url":"https://x","method":"GET","period":"soon"}"#),
            Err(DataConfigError::InvalidPeriod { .. })
        ));
        assert!(matches!(
            DataConfig::parse(r#"{"url":"no scheme","method":"GET","period":"1h"}"#),
            Err(DataConfigError::InvalidUrl { .. })
        ));
    }
}
