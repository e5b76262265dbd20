//! Collaborator agents and the handlers behind their action groups.
//!
//! Each collaborator is a specialised agent registered under the supervisor.
//! Its action group is served by a function running `collaborator-runtime`,
//! which dispatches the function-call envelope to the domain handler here.
//!
//! ## Catalog
//!
//! | Collaborator | Domain | Functions |
//! |---|---|---|
//! | `weather-agent` | `weather` | `get_current_weather`, `get_forecast`, `get_weather_alerts` |
//! | `stock-agent` | `stock` | `get_stock_price`, `get_market_summary`, `get_company_info` |
//! | `news-agent` | `news` | `get_top_headlines`, `search_news`, `get_news_by_source` |

pub mod envelope;
mod news;
mod stock;
mod weather;

pub use envelope::{dispatch, dispatch_payload, ActionRequest, ActionResponse, Parameter};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ProvisionError;

/// Environment variable naming the domain a function serves.
pub const DOMAIN_ENV: &str = "COLLABORATOR_DOMAIN";

/// Task domain of a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Weather,
    Stock,
    News,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Weather, Domain::Stock, Domain::News];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Weather => "weather",
            Domain::Stock => "stock",
            Domain::News => "news",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weather" => Ok(Domain::Weather),
            "stock" | "stocks" => Ok(Domain::Stock),
            "news" => Ok(Domain::News),
            other => Err(format!("unknown collaborator domain '{}'", other)),
        }
    }
}

// ============================================================================
// Function schemas
// ============================================================================

/// Parameter type accepted by action-group functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    pub required: bool,
}

/// One function of an action group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl FunctionSchema {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn required(self, name: &str, kind: ParameterType, description: &str) -> Self {
        self.param(name, kind, description, true)
    }

    pub fn optional(self, name: &str, kind: ParameterType, description: &str) -> Self {
        self.param(name, kind, description, false)
    }

    fn param(mut self, name: &str, kind: ParameterType, description: &str, required: bool) -> Self {
        self.parameters.push(ParameterSpec {
            name: name.to_string(),
            description: description.to_string(),
            kind,
            required,
        });
        self
    }

    /// Wire shape of the function schema: parameters keyed by name.
    pub fn to_wire(&self) -> Value {
        let parameters: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::json!({
                        "description": p.description,
                        "required": p.required,
                        "type": p.kind.as_str(),
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": parameters,
        })
    }
}

/// Check a function list before it is sent anywhere.
pub fn validate_functions(functions: &[FunctionSchema]) -> Result<(), ProvisionError> {
    if functions.is_empty() {
        return Err(ProvisionError::InvalidDefinition(
            "action group has no functions".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for f in functions {
        if f.name.is_empty() || f.description.is_empty() {
            return Err(ProvisionError::InvalidDefinition(format!(
                "function '{}' needs a name and a description",
                f.name
            )));
        }
        if !seen.insert(f.name.as_str()) {
            return Err(ProvisionError::InvalidDefinition(format!(
                "duplicate function '{}'",
                f.name
            )));
        }
        let mut params = std::collections::HashSet::new();
        for p in &f.parameters {
            if p.name.is_empty() || !params.insert(p.name.as_str()) {
                return Err(ProvisionError::InvalidDefinition(format!(
                    "function '{}' has an empty or duplicate parameter name",
                    f.name
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Collaborator catalog
// ============================================================================

/// Immutable description of one collaborator agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorConfig {
    pub name: String,
    pub domain: Domain,
    pub instruction: String,
    pub description: String,
    pub action_group_name: String,
    pub action_group_description: String,
    pub functions: Vec<FunctionSchema>,
    pub enabled: bool,
}

impl CollaboratorConfig {
    /// Instruction the supervisor receives for delegating to this collaborator.
    pub fn collaboration_instruction(&self) -> String {
        format!("{} handles delegated tasks from supervisor", self.name)
    }
}

/// Every collaborator this crate knows how to deploy.
pub fn catalog() -> Vec<CollaboratorConfig> {
    Domain::ALL.iter().map(|d| collaborator(*d)).collect()
}

/// The collaborator serving a domain.
pub fn collaborator(domain: Domain) -> CollaboratorConfig {
    match domain {
        Domain::Weather => weather::config(),
        Domain::Stock => stock::config(),
        Domain::News => news::config(),
    }
}

/// Which collaborators a deployment includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub weather: bool,
    pub stock: bool,
    pub news: bool,
}

impl Default for Selection {
    fn default() -> Self {
        Self::all()
    }
}

impl Selection {
    pub fn all() -> Self {
        Self {
            weather: true,
            stock: true,
            news: true,
        }
    }

    pub fn without(mut self, domain: Domain) -> Self {
        match domain {
            Domain::Weather => self.weather = false,
            Domain::Stock => self.stock = false,
            Domain::News => self.news = false,
        }
        self
    }

    pub fn includes(&self, domain: Domain) -> bool {
        match domain {
            Domain::Weather => self.weather,
            Domain::Stock => self.stock,
            Domain::News => self.news,
        }
    }

    /// Enabled collaborators in catalog order.
    pub fn collaborators(&self) -> Vec<CollaboratorConfig> {
        catalog()
            .into_iter()
            .filter(|c| c.enabled && self.includes(c.domain))
            .collect()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Failure inside a handler; reported to the agent as `{"error": ...}`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid value for parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },
}

/// Serves the functions of one collaborator domain.
pub trait ActionHandler: Send + Sync {
    fn domain(&self) -> Domain;

    /// Run `function` and return its JSON result.
    fn handle(&self, function: &str, params: &[Parameter]) -> Result<Value, HandlerError>;
}

/// Value of a named parameter, or `default` when absent.
pub fn param<'a>(params: &'a [Parameter], name: &str, default: &'a str) -> &'a str {
    params
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.value.as_str())
        .unwrap_or(default)
}

fn now() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn iso(t: chrono::NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Registry of handlers by domain.
pub struct HandlerRegistry {
    handlers: HashMap<Domain, Arc<dyn ActionHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Registry with every built-in handler.
    pub fn new() -> Self {
        let mut handlers: HashMap<Domain, Arc<dyn ActionHandler>> = HashMap::new();
        handlers.insert(Domain::Weather, Arc::new(weather::WeatherHandler));
        handlers.insert(Domain::Stock, Arc::new(stock::StockHandler));
        handlers.insert(Domain::News, Arc::new(news::NewsHandler));
        Self { handlers }
    }

    pub fn get(&self, domain: Domain) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&domain).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_three_domains_with_three_functions_each() {
        let all = catalog();
        assert_eq!(
            all.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["weather-agent", "stock-agent", "news-agent"]
        );
        for c in &all {
            assert_eq!(c.functions.len(), 3);
            validate_functions(&c.functions).unwrap();
        }
    }

    #[test]
    fn selection_filters_disabled_domains() {
        let names: Vec<String> = Selection::all()
            .without(Domain::News)
            .collaborators()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["weather-agent", "stock-agent"]);

        let none = Selection::all()
            .without(Domain::Weather)
            .without(Domain::Stock)
            .without(Domain::News);
        assert!(none.collaborators().is_empty());
    }

    #[test]
    fn schema_wire_shape_keys_parameters_by_name() {
        let wire = FunctionSchema::new("get_forecast", "Forecast")
            .required("location", ParameterType::String, "City")
            .optional("days", ParameterType::Integer, "Days")
            .to_wire();
        assert_eq!(wire["parameters"]["location"]["required"], true);
        assert_eq!(wire["parameters"]["days"]["type"], "integer");
    }

    #[test]
    fn duplicate_functions_are_rejected() {
        let f = FunctionSchema::new("a", "A");
        assert!(validate_functions(&[f.clone(), f]).is_err());
        assert!(validate_functions(&[]).is_err());
    }

    #[test]
    fn domain_parses() {
        assert_eq!("Weather".parse::<Domain>().unwrap(), Domain::Weather);
        assert_eq!("stocks".parse::<Domain>().unwrap(), Domain::Stock);
        assert!("sports".parse::<Domain>().is_err());
    }
}
