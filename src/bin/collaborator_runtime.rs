//! Function runtime for the collaborator handlers.
//!
//! Serves the handler named by `COLLABORATOR_DOMAIN`. Inside the function
//! platform it polls the runtime API given by `AWS_LAMBDA_RUNTIME_API`;
//! anywhere else it reads one action request per line from stdin and writes
//! one response per line to stdout.

use std::io::{BufRead, BufReader, Write};

use anyhow::{anyhow, Context};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_stack::collaborators::envelope::dispatch_payload;
use agent_stack::collaborators::{Domain, HandlerRegistry, DOMAIN_ENV};

const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
const RUNTIME_API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_stack=info,collaborator_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let domain: Domain = std::env::var(DOMAIN_ENV)
        .with_context(|| format!("{} is not set", DOMAIN_ENV))?
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let registry = HandlerRegistry::new();

    match std::env::var(RUNTIME_API_ENV) {
        Ok(api) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(serve_runtime_api(&api, domain, &registry))
        }
        Err(_) => serve_stdio(domain, &registry),
    }
}

/// Poll for invocations until the platform stops the process.
async fn serve_runtime_api(
    api: &str,
    domain: Domain,
    registry: &HandlerRegistry,
) -> anyhow::Result<()> {
    info!(domain = %domain, api = %api, "Serving function runtime API");
    let client = reqwest::Client::new();
    let base = format!("http://{}/{}/runtime/invocation", api, RUNTIME_API_VERSION);

    loop {
        let next = client
            .get(format!("{}/next", base))
            .send()
            .await
            .context("failed to fetch next invocation")?;
        let request_id = next
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("invocation without {} header", REQUEST_ID_HEADER))?;
        let payload = next.bytes().await?;
        debug!(request_id = %request_id, bytes = payload.len(), "Received invocation");

        let response = dispatch_payload(registry, domain, &payload);
        if let Err(e) = client
            .post(format!("{}/{}/response", base, request_id))
            .body(response)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            error!(request_id = %request_id, "Failed to post response: {}", e);
        }
    }
}

fn serve_stdio(domain: Domain, registry: &HandlerRegistry) -> anyhow::Result<()> {
    debug!(domain = %domain, "Serving action requests on stdin");
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch_payload(registry, domain, line.as_bytes());
        stdout.write_all(&response)?;
        writeln!(stdout)?;
        stdout.flush()?;
    }
    Ok(())
}
