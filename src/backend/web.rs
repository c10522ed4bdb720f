use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{AsyncSource, Entry, EntryIter, EntryPages, SinglePage, Source};
use crate::cache::WebCache;
use crate::error::{Result, StagError};

/// 单个 URL 作为只读源，所有抓取都经过 `WebCache`
///
/// 资源本身就是唯一条目：条目名为空串或 URL 最后一段都指向它。
pub struct WebSource {
    url: String,
    cache: Arc<WebCache>,
    ttl: Duration,
}

impl WebSource {
    pub fn new(url: impl Into<String>, cache: Arc<WebCache>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            cache,
            ttl,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// URL 最后一段（去掉 query / fragment）
    pub fn resource_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or("");
        let after_scheme = path.split_once("://").map(|(_, r)| r).unwrap_or(path);
        match after_scheme.split_once('/') {
            Some((_, p)) => p.rsplit('/').next().unwrap_or(""),
            None => "",
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name == self.resource_name() {
            Ok(())
        } else {
            Err(StagError::NotFound(format!("{} has no entry `{}`", self.url, name)))
        }
    }

    fn entry(&self, body: &[u8]) -> Entry {
        Entry::new(self.resource_name(), body.len() as u64)
    }
}

impl Source for WebSource {
    fn list(&self) -> Result<EntryIter<'_>> {
        let body = self.cache.get_or_fetch(&self.url, self.ttl)?;
        Ok(Box::new(std::iter::once(Ok(self.entry(&body)))))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.check_name(name)?;
        self.cache.get_or_fetch(&self.url, self.ttl)
    }
}

#[async_trait]
impl AsyncSource for WebSource {
    async fn list(&self) -> Result<EntryPages> {
        let body = self.cache.get_or_fetch_async(&self.url, self.ttl).await?;
        Ok(SinglePage::boxed(vec![self.entry(&body)]))
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.check_name(name)?;
        self.cache.get_or_fetch_async(&self.url, self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::web::tests::CountingFetcher;
    use crate::config::WebConfig;

    fn source(url: &str) -> WebSource {
        let dir = std::env::temp_dir().join(format!(
            "stagfs-websrc-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let f = Arc::new(CountingFetcher::default());
        let cache = Arc::new(WebCache::new(dir, &WebConfig::default(), f.clone(), f));
        WebSource::new(url, cache, Duration::from_secs(60))
    }

    #[test]
    fn resource_name_strips_query() {
        assert_eq!(source("https://h.example/a/b/data.csv?x=1").resource_name(), "data.csv");
        assert_eq!(source("https://h.example").resource_name(), "");
    }

    #[test]
    fn single_entry_listing_and_reads() {
        let s = source("http://h/dir/file.txt");
        let entries: Vec<Entry> = Source::list(&s).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "file.txt");
        let body = Source::read(&s, "").unwrap();
        assert_eq!(Source::read(&s, "file.txt").unwrap(), body);
        assert!(Source::read(&s, "other").unwrap_err().is_not_found());
    }
}
