//! Query resolution.
//!
//! The query text defaults to the triggering item's title and description.
//! When that text mentions another issue or ticket the source can fetch,
//! the referenced item's title and description are searched for instead.
//! Results are still reported against the trigger.
//!
//! Reference syntax and corpus depend on the configured platform:
//!
//! | Provider | Reference | Corpus |
//! |----------|-----------|--------|
//! | GitHub / GitLab | `#123` (not inside URLs or `&#123;` entities) | `issues` |
//! | Jira | `KEY-123`, limited to the project key when one is set | `jira` |

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::models::{Query, QuerySource, Repository, TriggeringItem};
use crate::sources::ItemSource;

/// References tried per trigger before falling back to its own text.
const MAX_REFERENCE_LOOKUPS: usize = 5;

/// Issue platform the engine is configured for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueProvider {
    GitHub,
    GitLab,
    Jira { project_key: Option<String> },
}

fn hash_reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^\w&/#])#(\d+)\b").expect("valid regex"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").expect("valid regex"))
}

fn jira_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z][A-Z0-9_]+)-(\d+)\b").expect("valid regex"))
}

impl IssueProvider {
    /// Corpus label used in partition keys.
    pub fn corpus(&self) -> &'static str {
        match self {
            IssueProvider::GitHub | IssueProvider::GitLab => "issues",
            IssueProvider::Jira { .. } => "jira",
        }
    }

    /// Partition holding this provider's items for `repository`.
    pub fn partition(&self, repository: &Repository) -> String {
        repository.partition(self.corpus())
    }

    /// References mentioned in `text`, in order of appearance, without
    /// duplicates and without the trigger itself.
    pub fn find_references(&self, text: &str, trigger: &TriggeringItem) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut push = |reference: String| {
            if reference != trigger.reference && !found.contains(&reference) {
                found.push(reference);
            }
        };

        match self {
            IssueProvider::GitHub | IssueProvider::GitLab => {
                let without_urls = url_re().replace_all(text, " ");
                for caps in hash_reference_re().captures_iter(&without_urls) {
                    let Ok(number) = caps[1].parse::<u64>() else {
                        continue;
                    };
                    if trigger.number == Some(number) {
                        continue;
                    }
                    push(format!("#{}", number));
                }
            }
            IssueProvider::Jira { project_key } => {
                for caps in jira_key_re().captures_iter(text) {
                    if let Some(key) = project_key {
                        if &caps[1] != key {
                            continue;
                        }
                    }
                    push(format!("{}-{}", &caps[1], &caps[2]));
                }
            }
        }
        found
    }
}

/// Builds the retrieval query for a triggering item.
pub struct QueryResolver {
    provider: IssueProvider,
    source: Arc<dyn ItemSource>,
}

impl QueryResolver {
    pub fn new(provider: IssueProvider, source: Arc<dyn ItemSource>) -> Self {
        Self { provider, source }
    }

    pub fn provider(&self) -> &IssueProvider {
        &self.provider
    }

    /// Resolve the query text. Lookup failures fall back to the trigger's
    /// own text and never fail the request.
    pub async fn resolve(&self, repository: &Repository, trigger: &TriggeringItem) -> Query {
        let partition = self.provider.partition(repository);
        let references = self.provider.find_references(&trigger.text(), trigger);

        for reference in references.into_iter().take(MAX_REFERENCE_LOOKUPS) {
            match self.source.fetch_issue(repository, &reference).await {
                Ok(Some(item)) if item.is_pull_request => {
                    debug!(%reference, "referenced item is a pull request");
                }
                Ok(Some(item)) => {
                    let text = item.embed_text();
                    if text.is_empty() {
                        debug!(%reference, "referenced item has no text");
                        continue;
                    }
                    debug!(trigger = %trigger.reference, %reference, "query uses cross-reference");
                    return Query {
                        text,
                        source: QuerySource::CrossReference { reference },
                        trigger: trigger.reference.clone(),
                        partition,
                    };
                }
                Ok(None) => {
                    debug!(%reference, "referenced item not found");
                }
                Err(e) => {
                    warn!(%reference, error = %e, "cross-reference lookup failed, using trigger text");
                    break;
                }
            }
        }

        Query {
            text: trigger.text(),
            source: QuerySource::Trigger,
            trigger: trigger.reference.clone(),
            partition,
        }
    }
}
