use crate::error::{Result, StagError};
use crate::locator::{redact_connection, resolve_placeholders};

/// 解析后的连接身份（纯数据，sync/async 两个后端共用）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub account: String,
    pub account_key: Option<String>,
    pub sas: Option<String>,
    pub protocol: String,
    pub endpoint_suffix: String,
    pub blob_endpoint: Option<String>,
}

impl ConnectionConfig {
    /// 连接时调用：先做 `{{env.*}}` 严格替换，再解析
    pub fn resolve(raw: &str) -> Result<Self> {
        let text = resolve_placeholders(raw)?;
        Self::parse(&text)
    }

    /// 两种形态：裸账户名，或 `Key=Value;...`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim().trim_end_matches(';');
        if text.is_empty() {
            return Err(StagError::invalid("", "empty connection string"));
        }
        let mut cfg = ConnectionConfig {
            account: String::new(),
            account_key: None,
            sas: None,
            protocol: "https".to_string(),
            endpoint_suffix: "core.windows.net".to_string(),
            blob_endpoint: None,
        };
        if !text.contains('=') {
            cfg.account = text.to_string();
            return Ok(cfg);
        }
        for part in text.split(';').filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(StagError::invalid(
                    redact_connection(text),
                    format!("malformed connection segment `{}`", key_only(part)),
                ));
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "accountname" => cfg.account = value.to_string(),
                "accountkey" => cfg.account_key = Some(value.to_string()),
                "sharedaccesssignature" => cfg.sas = Some(value.to_string()),
                "defaultendpointsprotocol" => cfg.protocol = value.to_string(),
                "endpointsuffix" => cfg.endpoint_suffix = value.to_string(),
                "blobendpoint" => cfg.blob_endpoint = Some(value.trim_end_matches('/').to_string()),
                other => tracing::debug!("ignoring connection key `{}`", other),
            }
        }
        if cfg.account.is_empty() {
            return Err(StagError::invalid(redact_connection(text), "missing AccountName"));
        }
        Ok(cfg)
    }

    pub fn endpoint(&self) -> String {
        match &self.blob_endpoint {
            Some(ep) => ep.clone(),
            None => format!("{}://{}.blob.{}", self.protocol, self.account, self.endpoint_suffix),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.account_key.is_some() || self.sas.is_some()
    }
}

fn key_only(part: &str) -> &str {
    // 没有 `=` 的片段可能就是泄漏的 key 本身，只报前几个字符
    let end = part.char_indices().nth(8).map(|(i, _)| i).unwrap_or(part.len());
    &part[..end]
}
