//! Function-call envelope exchanged between an agent and its action-group
//! function.
//!
//! Request:
//!
//! ```json
//! {"actionGroup": "weather-actions", "function": "get_forecast",
//!  "parameters": [{"name": "location", "type": "string", "value": "Paris"}]}
//! ```
//!
//! Response:
//!
//! ```json
//! {"messageVersion": "1.0",
//!  "response": {"actionGroup": "weather-actions", "function": "get_forecast",
//!               "functionResponse": {"responseBody": {"TEXT": {"body": "<json>"}}}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Domain, HandlerRegistry};

pub const MESSAGE_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: String,
}

impl Parameter {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: None,
            value: value.to_string(),
        }
    }
}

/// Invocation event sent by the agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    #[serde(default)]
    pub action_group: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ActionRequest {
    pub fn new(action_group: &str, function: &str, parameters: Vec<Parameter>) -> Self {
        Self {
            action_group: action_group.to_string(),
            function: function.to_string(),
            parameters,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(rename = "TEXT")]
    pub text: TextBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub response_body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub action_group: String,
    pub function: String,
    pub function_response: FunctionResponse,
}

/// Response returned to the agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub message_version: String,
    pub response: ResponsePayload,
}

impl ActionResponse {
    /// Wrap a JSON result for the request it answers.
    pub fn new(action_group: &str, function: &str, result: &Value) -> Self {
        Self {
            message_version: MESSAGE_VERSION.to_string(),
            response: ResponsePayload {
                action_group: action_group.to_string(),
                function: function.to_string(),
                function_response: FunctionResponse {
                    response_body: ResponseBody {
                        text: TextBody {
                            body: result.to_string(),
                        },
                    },
                },
            },
        }
    }

    /// The body string.
    pub fn body(&self) -> &str {
        &self.response.function_response.response_body.text.body
    }

    /// The body parsed back into JSON.
    pub fn body_json(&self) -> Value {
        serde_json::from_str(self.body()).unwrap_or(Value::Null)
    }
}

fn error_body(message: impl std::fmt::Display) -> Value {
    serde_json::json!({ "error": message.to_string() })
}

/// Run a request against the handler of `domain`.
///
/// Handler failures and unknown functions become an `{"error": ...}` body;
/// this never fails.
pub fn dispatch(
    registry: &HandlerRegistry,
    domain: Domain,
    request: &ActionRequest,
) -> ActionResponse {
    debug!(
        domain = %domain,
        action_group = %request.action_group,
        function = %request.function,
        "Handling action request"
    );

    let result = match registry.get(domain) {
        Some(handler) => match handler.handle(&request.function, &request.parameters) {
            Ok(value) => value,
            Err(e) => {
                warn!(domain = %domain, function = %request.function, "Handler error: {}", e);
                error_body(e)
            }
        },
        None => error_body(format!("No handler for domain: {}", domain)),
    };

    ActionResponse::new(&request.action_group, &request.function, &result)
}

/// Decode a raw event, dispatch it, and encode the response.
///
/// A malformed event still gets a well-formed response with an error body.
pub fn dispatch_payload(registry: &HandlerRegistry, domain: Domain, payload: &[u8]) -> Vec<u8> {
    let response = match serde_json::from_slice::<ActionRequest>(payload) {
        Ok(request) => dispatch(registry, domain, &request),
        Err(e) => {
            warn!(domain = %domain, "Malformed action request: {}", e);
            ActionResponse::new("", "", &error_body(format!("Malformed request: {}", e)))
        }
    };
    // Serializing plain strings and maps cannot fail.
    serde_json::to_vec(&response).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
    }

    fn has_fields(body: &Value, fields: &[&str]) {
        for f in fields {
            assert!(body.get(*f).is_some(), "missing field {f} in {body}");
        }
    }

    #[test]
    fn response_has_exact_wire_shape() {
        let request = ActionRequest::new(
            "weather-actions",
            "get_current_weather",
            vec![Parameter::new("location", "Paris")],
        );
        let response = dispatch(&registry(), Domain::Weather, &request);
        let wire = serde_json::to_value(&response).unwrap();

        assert_eq!(wire["messageVersion"], "1.0");
        assert_eq!(wire["response"]["actionGroup"], "weather-actions");
        assert_eq!(wire["response"]["function"], "get_current_weather");
        let body = wire["response"]["functionResponse"]["responseBody"]["TEXT"]["body"]
            .as_str()
            .unwrap();
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["location"], "Paris");
    }

    #[test]
    fn every_mock_function_returns_documented_fields() {
        let cases: Vec<(Domain, &str, Vec<Parameter>, Vec<&str>)> = vec![
            (
                Domain::Weather,
                "get_current_weather",
                vec![Parameter::new("location", "Oslo")],
                vec!["location", "temperature", "condition", "humidity", "wind_speed", "timestamp"],
            ),
            (
                Domain::Weather,
                "get_forecast",
                vec![Parameter::new("location", "Oslo"), Parameter::new("days", "3")],
                vec!["location", "forecast"],
            ),
            (
                Domain::Weather,
                "get_weather_alerts",
                vec![Parameter::new("location", "Oslo")],
                vec!["location", "alerts"],
            ),
            (
                Domain::Stock,
                "get_stock_price",
                vec![Parameter::new("symbol", "msft")],
                vec!["symbol", "price", "change", "change_percent", "volume", "timestamp"],
            ),
            (Domain::Stock, "get_market_summary", vec![], vec!["indices", "timestamp"]),
            (
                Domain::Stock,
                "get_company_info",
                vec![Parameter::new("symbol", "AAPL")],
                vec!["name", "sector", "market_cap", "symbol"],
            ),
            (
                Domain::News,
                "get_top_headlines",
                vec![Parameter::new("category", "technology")],
                vec!["category", "headlines"],
            ),
            (
                Domain::News,
                "search_news",
                vec![Parameter::new("query", "rust")],
                vec!["query", "articles"],
            ),
            (
                Domain::News,
                "get_news_by_source",
                vec![Parameter::new("source", "BBC")],
                vec!["source", "articles"],
            ),
        ];

        for (domain, function, params, fields) in cases {
            let request = ActionRequest::new("group", function, params);
            let body = dispatch(&registry(), domain, &request).body_json();
            assert!(body.get("error").is_none(), "{function} failed: {body}");
            has_fields(&body, &fields);
        }
    }

    #[test]
    fn unknown_function_reports_error_body() {
        let request = ActionRequest::new("stock-actions", "get_dividends", vec![]);
        let body = dispatch(&registry(), Domain::Stock, &request).body_json();
        assert_eq!(body, serde_json::json!({"error": "Unknown function: get_dividends"}));
    }

    #[test]
    fn invalid_parameter_reports_error_body() {
        let request = ActionRequest::new(
            "weather-actions",
            "get_forecast",
            vec![Parameter::new("days", "many")],
        );
        let body = dispatch(&registry(), Domain::Weather, &request).body_json();
        assert!(body["error"].as_str().unwrap().contains("days"));
    }

    #[test]
    fn raw_payload_round_trip_and_malformed_input() {
        let payload =
            br#"{"messageVersion":"1.0","actionGroup":"news-actions","function":"search_news","parameters":[{"name":"query","type":"string","value":"ai"}],"sessionId":"s1","agent":{"name":"x"}}"#;
        let out = dispatch_payload(&registry(), Domain::News, payload);
        let response: ActionResponse = serde_json::from_slice(&out).unwrap();
        assert_eq!(response.response.function, "search_news");
        assert_eq!(response.body_json()["query"], "ai");

        let out = dispatch_payload(&registry(), Domain::News, b"not json");
        let response: ActionResponse = serde_json::from_slice(&out).unwrap();
        assert!(response.body_json()["error"].is_string());
    }
}
