//! Weather collaborator with mock data.

use chrono::Duration;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};

use super::{
    iso, now, param, ActionHandler, CollaboratorConfig, Domain, FunctionSchema, HandlerError,
    Parameter, ParameterType,
};

const CONDITIONS: [&str; 4] = ["Sunny", "Cloudy", "Rainy", "Partly Cloudy"];
const DEFAULT_LOCATION: &str = "New York";

pub(super) fn config() -> CollaboratorConfig {
    CollaboratorConfig {
        name: "weather-agent".to_string(),
        domain: Domain::Weather,
        instruction: "You are a weather information expert. Help users get weather forecasts, \
                      current conditions, and weather alerts for any location."
            .to_string(),
        description: "Weather information and forecast agent".to_string(),
        action_group_name: "weather-actions".to_string(),
        action_group_description: "Actions for weather information retrieval".to_string(),
        functions: vec![
            FunctionSchema::new(
                "get_current_weather",
                "Get current weather conditions for a location",
            )
            .required("location", ParameterType::String, "City name or location"),
            FunctionSchema::new("get_forecast", "Get weather forecast for upcoming days")
                .required("location", ParameterType::String, "City name or location")
                .optional(
                    "days",
                    ParameterType::Integer,
                    "Number of days for forecast (1-7)",
                ),
            FunctionSchema::new(
                "get_weather_alerts",
                "Get weather alerts and warnings for a location",
            )
            .required("location", ParameterType::String, "City name or location"),
        ],
        enabled: true,
    }
}

fn condition(rng: &mut impl Rng) -> &'static str {
    CONDITIONS.choose(rng).copied().unwrap_or("Sunny")
}

pub(super) struct WeatherHandler;

impl ActionHandler for WeatherHandler {
    fn domain(&self) -> Domain {
        Domain::Weather
    }

    fn handle(&self, function: &str, params: &[Parameter]) -> Result<Value, HandlerError> {
        let mut rng = rand::thread_rng();
        let location = param(params, "location", DEFAULT_LOCATION);

        match function {
            "get_current_weather" => Ok(json!({
                "location": location,
                "temperature": rng.gen_range(60..=85),
                "condition": condition(&mut rng),
                "humidity": rng.gen_range(40..=80),
                "wind_speed": rng.gen_range(5..=20),
                "timestamp": iso(now()),
            })),
            "get_forecast" => {
                let raw = param(params, "days", "5");
                let days: i64 = raw.trim().parse().map_err(|_| HandlerError::InvalidParameter {
                    name: "days".to_string(),
                    message: format!("'{}' is not an integer", raw),
                })?;
                let today = now();
                let forecast: Vec<Value> = (0..days.clamp(0, 14))
                    .map(|i| {
                        json!({
                            "date": (today + Duration::days(i)).format("%Y-%m-%d").to_string(),
                            "high": rng.gen_range(70..=90),
                            "low": rng.gen_range(50..=70),
                            "condition": condition(&mut rng),
                        })
                    })
                    .collect();
                Ok(json!({ "location": location, "forecast": forecast }))
            }
            "get_weather_alerts" => {
                let alerts = if rng.gen_bool(0.5) {
                    vec![json!({
                        "type": "Heat Advisory",
                        "severity": "Moderate",
                        "expires": "2024-01-20T18:00:00",
                    })]
                } else {
                    Vec::new()
                };
                Ok(json!({ "location": location, "alerts": alerts }))
            }
            other => Err(HandlerError::UnknownFunction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forecast_length_follows_days() {
        let body = WeatherHandler
            .handle(
                "get_forecast",
                &[Parameter::new("location", "Lima"), Parameter::new("days", "3")],
            )
            .unwrap();
        assert_eq!(body["forecast"].as_array().unwrap().len(), 3);
        assert!(body["forecast"][0]["high"].as_i64().unwrap() >= 70);
    }

    #[test]
    fn location_defaults_to_new_york() {
        let body = WeatherHandler.handle("get_current_weather", &[]).unwrap();
        assert_eq!(body["location"], DEFAULT_LOCATION);
        let t = body["temperature"].as_i64().unwrap();
        assert!((60..=85).contains(&t));
    }
}
