//! searchWeb tool: DuckDuckGo Instant Answer wrapper.
//!
//! A search never fails from the caller's point of view; every outcome,
//! including network and parse failures, is a [`SearchOutcome`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use carbot_core::config::ToolsConfig;
use carbot_core::types::SearchResult;

use crate::{Tool, ToolContext, ToolOutput};

pub const TOOL_NAME: &str = "searchWeb";

/// Result of one search, serialized as the tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub success: bool,
    pub results: Vec<SearchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchOutcome {
    fn found(results: Vec<SearchResult>) -> Self {
        Self {
            success: true,
            results,
            message: None,
            error: None,
        }
    }

    fn empty(query: &str) -> Self {
        Self {
            success: true,
            results: Vec::new(),
            message: Some(format!(
                "No search results found for \"{query}\". Answer from your own knowledge \
                 and mention that current information could not be verified."
            )),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            message: None,
            error: Some(error.into()),
        }
    }
}

pub struct WebSearchTool {
    client: reqwest::Client,
    base_url: String,
    max_results: usize,
}

#[derive(Deserialize)]
struct Params {
    query: String,
}

impl WebSearchTool {
    pub fn new(config: &ToolsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.search_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to a search client without timeout");
                reqwest::Client::new()
            });
        Self {
            client,
            base_url: config.search_api_url.trim_end_matches('/').to_string(),
            max_results: config.max_results,
        }
    }

    /// Query the search backend.
    pub async fn search(&self, query: &str) -> SearchOutcome {
        let query = query.trim();
        if query.is_empty() {
            return SearchOutcome::failed("Search query must not be empty");
        }

        debug!(query, base_url = %self.base_url, "searchWeb");

        let resp = self
            .client
            .get(format!("{}/", self.base_url))
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Search request failed");
                return SearchOutcome::failed(format!("Search API error: {e}"));
            }
        };

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "Search API returned an error status");
            return SearchOutcome::failed(format!("Search API returned HTTP {}", resp.status()));
        }

        // DuckDuckGo may answer with a non-JSON content type, so parse the text
        let body = match resp.text().await.map(|t| serde_json::from_str::<Value>(&t)) {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return SearchOutcome::failed(format!("Invalid search response: {e}")),
            Err(e) => return SearchOutcome::failed(format!("Search API error: {e}")),
        };

        let results = shape_results(&body, self.max_results);
        info!(query, results = results.len(), "Search finished");

        if results.is_empty() {
            SearchOutcome::empty(query)
        } else {
            SearchOutcome::found(results)
        }
    }
}

/// Turn an Instant Answer response into search results: the summary first,
/// then up to `max_related` related topics.
pub fn shape_results(body: &Value, max_related: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();

    if let Some(abstract_text) = non_empty(&body["AbstractText"]) {
        results.push(SearchResult {
            title: non_empty(&body["Heading"])
                .unwrap_or("Summary")
                .to_string(),
            snippet: abstract_text.to_string(),
            url: non_empty(&body["AbstractURL"]).map(str::to_string),
        });
    }

    let topics = body["RelatedTopics"].as_array().into_iter().flatten();
    let related = topics
        .flat_map(|topic| match topic["Topics"].as_array() {
            // Grouped topics nest one level deep
            Some(group) => group.iter().collect::<Vec<_>>(),
            None => vec![topic],
        })
        .filter_map(related_result)
        .take(max_related);
    results.extend(related);

    results
}

fn related_result(topic: &Value) -> Option<SearchResult> {
    let text = non_empty(&topic["Text"])?;
    let title = text
        .split_once(" - ")
        .map(|(title, _)| title)
        .unwrap_or(text);
    Some(SearchResult {
        title: title.to_string(),
        snippet: text.to_string(),
        url: non_empty(&topic["FirstURL"]).map(str::to_string),
    })
}

fn non_empty(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search the web for current car-related information: news, prices, reviews, \
         recalls, and technical specifications."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query, e.g. \"2025 Porsche 911 GT3 price\""
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let p: Params = serde_json::from_value(params)?;
        debug!(turn_id = %context.turn_id, query = %p.query, "searchWeb requested");
        let outcome = self.search(&p.query).await;
        Ok(ToolOutput {
            is_error: !outcome.success,
            content: serde_json::to_value(outcome)?,
        })
    }
}
