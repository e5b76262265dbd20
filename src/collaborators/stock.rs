//! Stock market collaborator with mock data.

use rand::Rng;
use serde_json::{json, Value};

use super::{
    iso, now, param, ActionHandler, CollaboratorConfig, Domain, FunctionSchema, HandlerError,
    Parameter, ParameterType,
};

pub(super) fn config() -> CollaboratorConfig {
    CollaboratorConfig {
        name: "stock-agent".to_string(),
        domain: Domain::Stock,
        instruction: "You are a stock market expert. Help users get stock prices, market data, \
                      and financial information."
            .to_string(),
        description: "Stock market and financial data agent".to_string(),
        action_group_name: "stock-actions".to_string(),
        action_group_description: "Actions for stock market operations".to_string(),
        functions: vec![
            FunctionSchema::new("get_stock_price", "Get current stock price and details").required(
                "symbol",
                ParameterType::String,
                "Stock ticker symbol (e.g., AAPL, GOOGL)",
            ),
            FunctionSchema::new(
                "get_market_summary",
                "Get overall market summary and major indices",
            ),
            FunctionSchema::new("get_company_info", "Get company information and details")
                .required("symbol", ParameterType::String, "Stock ticker symbol"),
        ],
        enabled: true,
    }
}

fn base_price(symbol: &str) -> f64 {
    match symbol {
        "AAPL" => 175.0,
        "GOOGL" => 140.0,
        "MSFT" => 380.0,
        "AMZN" => 155.0,
        "TSLA" => 245.0,
        _ => 100.0,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub(super) struct StockHandler;

impl ActionHandler for StockHandler {
    fn domain(&self) -> Domain {
        Domain::Stock
    }

    fn handle(&self, function: &str, params: &[Parameter]) -> Result<Value, HandlerError> {
        let mut rng = rand::thread_rng();
        let symbol = param(params, "symbol", "AAPL").to_uppercase();

        match function {
            "get_stock_price" => Ok(json!({
                "price": round2(base_price(&symbol) + rng.gen_range(-5.0..5.0)),
                "change": round2(rng.gen_range(-3.0..3.0)),
                "change_percent": round2(rng.gen_range(-2.0..2.0)),
                "volume": rng.gen_range(1_000_000..=50_000_000u64),
                "timestamp": iso(now()),
                "symbol": symbol,
            })),
            "get_market_summary" => Ok(json!({
                "indices": [
                    {"name": "S&P 500", "value": 4783.45, "change": 12.34, "change_percent": 0.26},
                    {"name": "NASDAQ", "value": 15043.12, "change": -23.45, "change_percent": -0.16},
                    {"name": "DOW", "value": 37305.16, "change": 45.67, "change_percent": 0.12},
                ],
                "timestamp": iso(now()),
            })),
            "get_company_info" => {
                let (name, sector, cap) = match symbol.as_str() {
                    "AAPL" => ("Apple Inc.", "Technology", "2.8T"),
                    "GOOGL" => ("Alphabet Inc.", "Technology", "1.7T"),
                    "MSFT" => ("Microsoft Corporation", "Technology", "2.9T"),
                    _ => ("Unknown", "N/A", "N/A"),
                };
                Ok(json!({
                    "name": name,
                    "sector": sector,
                    "market_cap": cap,
                    "symbol": symbol,
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
    fn price_stays_near_base() {
        let body = StockHandler
            .handle("get_stock_price", &[Parameter::new("symbol", "msft")])
            .unwrap();
        assert_eq!(body["symbol"], "MSFT");
        let price = body["price"].as_f64().unwrap();
        assert!((375.0..=385.0).contains(&price));
    }

    #[test]
    fn unknown_company_is_reported_not_rejected() {
        let body = StockHandler
            .handle("get_company_info", &[Parameter::new("symbol", "zzz")])
            .unwrap();
        assert_eq!(body["name"], "Unknown");
        assert_eq!(body["symbol"], "ZZZ");
    }
}
