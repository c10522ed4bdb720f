use crate::error::{Result, StagError};

const OPEN: &str = "{{env.";
const CLOSE: &str = "}}";

/// 宽松替换：未设置的变量保留占位符原样
pub fn insert_environment_data(text: &str) -> String {
    match substitute(text, |name| std::env::var(name).ok(), false) {
        Ok(s) => s,
        Err(_) => text.to_string(),
    }
}

/// 严格替换（连接时使用）：任何未设置的变量 -> `MissingCredential`
pub fn resolve_placeholders(text: &str) -> Result<String> {
    substitute(text, |name| std::env::var(name).ok(), true)
}

pub(crate) fn substitute(
    text: &str,
    lookup: impl Fn(&str) -> Option<String>,
    strict: bool,
) -> Result<String> {
    if !text.contains(OPEN) {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        if !is_var_name(name) {
            // 不是合法占位符：原样输出开头，继续向后扫
            out.push_str(OPEN);
            rest = after;
            continue;
        }
        match lookup(name) {
            Some(v) => out.push_str(&v),
            None if strict => return Err(StagError::MissingCredential(name.to_string())),
            None => {
                out.push_str(OPEN);
                out.push_str(name);
                out.push_str(CLOSE);
            }
        }
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
