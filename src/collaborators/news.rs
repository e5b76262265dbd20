//! News collaborator with mock data.

use chrono::Duration;
use serde_json::{json, Value};

use super::{
    iso, now, param, ActionHandler, CollaboratorConfig, Domain, FunctionSchema, HandlerError,
    Parameter, ParameterType,
};

pub(super) fn config() -> CollaboratorConfig {
    CollaboratorConfig {
        name: "news-agent".to_string(),
        domain: Domain::News,
        instruction: "You are a news information expert. Help users get latest news, headlines, \
                      and articles on various topics."
            .to_string(),
        description: "News and current events agent".to_string(),
        action_group_name: "news-actions".to_string(),
        action_group_description: "Actions for news retrieval".to_string(),
        functions: vec![
            FunctionSchema::new("get_top_headlines", "Get top news headlines by category").optional(
                "category",
                ParameterType::String,
                "News category (general, business, technology, sports, etc.)",
            ),
            FunctionSchema::new("search_news", "Search for news articles by keyword").required(
                "query",
                ParameterType::String,
                "Search query or keyword",
            ),
            FunctionSchema::new("get_news_by_source", "Get news from a specific source").required(
                "source",
                ParameterType::String,
                "News source name (e.g., BBC, CNN, Reuters)",
            ),
        ],
        enabled: true,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

pub(super) struct NewsHandler;

impl ActionHandler for NewsHandler {
    fn domain(&self) -> Domain {
        Domain::News
    }

    fn handle(&self, function: &str, params: &[Parameter]) -> Result<Value, HandlerError> {
        let t = now();
        let hours_ago = |h: i64| iso(t - Duration::hours(h));

        match function {
            "get_top_headlines" => {
                let category = param(params, "category", "general");
                let headlines = [
                    ("Tech Giants Announce AI Breakthrough", "Tech News", 0),
                    ("Global Markets Show Strong Growth", "Financial Times", 2),
                    ("Climate Summit Reaches Agreement", "World News", 5),
                    ("New Space Mission Launches Successfully", "Science Daily", 8),
                ];
                let headlines: Vec<Value> = headlines
                    .iter()
                    .take(3)
                    .map(|(title, source, h)| {
                        json!({ "title": title, "source": source, "published": hours_ago(*h) })
                    })
                    .collect();
                Ok(json!({ "category": category, "headlines": headlines }))
            }
            "search_news" => {
                let query = param(params, "query", "technology");
                Ok(json!({
                    "query": query,
                    "articles": [
                        {
                            "title": format!("Latest developments in {}", query),
                            "description": format!("Comprehensive coverage of recent {} news", query),
                            "source": "News Source",
                            "url": "https://example.com/article1",
                            "published": hours_ago(0),
                        },
                        {
                            "title": format!("{} industry sees major changes", capitalize(query)),
                            "description": format!("Analysis of {} trends and impacts", query),
                            "source": "Industry News",
                            "url": "https://example.com/article2",
                            "published": hours_ago(3),
                        },
                    ],
                }))
            }
            "get_news_by_source" => {
                let source = param(params, "source", "BBC");
                Ok(json!({
                    "source": source,
                    "articles": [
                        { "title": format!("Breaking: {} reports major event", source), "published": hours_ago(0) },
                        { "title": format!("{} exclusive interview", source), "published": hours_ago(4) },
                    ],
                }))
            }
            other => Err(HandlerError::UnknownFunction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headlines_are_capped_at_three() {
        let body = NewsHandler.handle("get_top_headlines", &[]).unwrap();
        assert_eq!(body["category"], "general");
        assert_eq!(body["headlines"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn search_capitalizes_second_title() {
        let body = NewsHandler
            .handle("search_news", &[Parameter::new("query", "rUST")])
            .unwrap();
        assert_eq!(body["articles"][1]["title"], "Rust industry sees major changes");
    }
}
