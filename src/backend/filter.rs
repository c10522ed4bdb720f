use wildmatch::WildMatch;

use super::{Entry, EntryIter};

/// 列举过滤：搜索掩码 + 只看顶层 + 条数上限
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    mask: Option<MaskMatcher>,
    flat: bool,
    max_entries: Option<usize>,
}

/// 掩码匹配：含 `*`/`?` 走通配符，否则按子串包含
#[derive(Clone, Debug)]
enum MaskMatcher {
    Contains(String),
    Glob { wild: WildMatch, prefix: Option<String> },
}

impl MaskMatcher {
    fn new(pattern: &str) -> Self {
        if pattern.contains('*') || pattern.contains('?') {
            // 通配符前的固定前缀，先做一次便宜的 starts_with
            let prefix = pattern
                .split(|c| c == '*' || c == '?')
                .next()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            MaskMatcher::Glob {
                wild: WildMatch::new(pattern),
                prefix,
            }
        } else {
            MaskMatcher::Contains(pattern.to_string())
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            MaskMatcher::Contains(p) => name.contains(p.as_str()),
            MaskMatcher::Glob { wild, prefix } => {
                if let Some(p) = prefix {
                    if !name.starts_with(p.as_str()) {
                        return false;
                    }
                }
                wild.matches(name)
            }
        }
    }
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask(mut self, pattern: &str) -> Self {
        self.mask = if pattern.is_empty() {
            None
        } else {
            Some(MaskMatcher::new(pattern))
        };
        self
    }

    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = Some(n);
        self
    }

    /// 不递归：只保留容器顶层的条目（名字里没有 `/`）
    pub fn flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    pub fn is_noop(&self) -> bool {
        self.mask.is_none() && !self.flat && self.max_entries.is_none()
    }

    pub fn accepts(&self, entry: &Entry) -> bool {
        if self.flat && entry.name.contains('/') {
            return false;
        }
        self.mask.as_ref().map_or(true, |m| m.matches(&entry.name))
    }

    /// 按页累积到 `out`；达到条数上限时返回 `true`，调用方不必再取下一页
    pub fn collect_page(&self, out: &mut Vec<Entry>, page: Vec<Entry>) -> bool {
        let limit = self.max_entries.unwrap_or(usize::MAX);
        for e in page {
            if out.len() >= limit {
                break;
            }
            if self.accepts(&e) {
                out.push(e);
            }
        }
        out.len() >= limit
    }

    /// 惰性套在任意列举上；错误原样透传
    pub fn apply<'a>(&self, iter: EntryIter<'a>) -> EntryIter<'a> {
        if self.is_noop() {
            return iter;
        }
        let this = self.clone();
        let filtered = iter.filter(move |r| match r {
            Ok(e) => this.accepts(e),
            Err(_) => true,
        });
        match self.max_entries {
            Some(n) => Box::new(filtered.take(n)),
            None => Box::new(filtered),
        }
    }

    pub fn apply_vec(&self, entries: Vec<Entry>) -> Vec<Entry> {
        let limit = self.max_entries.unwrap_or(usize::MAX);
        entries
            .into_iter()
            .filter(|e| self.accepts(e))
            .take(limit)
            .collect()
    }
}
