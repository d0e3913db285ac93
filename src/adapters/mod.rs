pub mod api_feed;
pub mod forum;
pub mod html_links;
pub mod ics;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::types::{SourceAdapter, SourceKind};
use std::collections::HashMap;
use std::sync::Arc;

/// All adapters keyed by the source kind they serve, sharing one HTTP client.
pub struct AdapterRegistry {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        let mut adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert(
            SourceKind::PullCalendar,
            Arc::new(ics::IcsAdapter::new(client.clone())),
        );
        adapters.insert(
            SourceKind::HtmlListing,
            Arc::new(html_links::HtmlLinksAdapter::new(
                client.clone(),
                config.link_discovery_cap,
            )),
        );
        adapters.insert(
            SourceKind::ForumScrape,
            Arc::new(forum::ForumAdapter::new(client.clone())),
        );
        adapters.insert(
            SourceKind::ApiFeed,
            Arc::new(api_feed::ApiFeedAdapter::new(client)),
        );
        Ok(Self { adapters })
    }

    /// Build a registry from explicit adapters; callers wire in stand-ins for
    /// the HTTP-backed set.
    pub fn with_adapters(adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn for_kind(&self, kind: SourceKind) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| PipelineError::Config(format!("no adapter for kind {}", kind.as_str())))
    }
}
