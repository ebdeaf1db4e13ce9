use std::time::Duration;

use clap::Parser;
use hyper::Uri;

use chat_relay::{
    Router,
    config::{Config, DEFAULT_MODEL, DEFAULT_MODEL_PREFIX, DEFAULT_UPSTREAM_URL},
    relay::ChatRelay,
    serve,
    service::NotFound,
    upstream::HttpUpstream,
};

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Address the relay listens to client connections on
    #[arg(short, long, env = "RELAY_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,
    /// Upstream chat completions endpoint
    #[arg(short, long, env = "UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    upstream: String,
    /// Upstream model used in place of OpenAI or unknown model names
    #[arg(short, long, env = "TARGET_GROK_MODEL", default_value = DEFAULT_MODEL)]
    model: String,
    /// Prefix of model names that are passed to the upstream unchanged
    #[arg(long, env = "UPSTREAM_MODEL_PREFIX", default_value = DEFAULT_MODEL_PREFIX)]
    model_prefix: String,
    /// Comma-separated list of accepted `x-proxy-key` values, check is disabled when empty
    #[arg(long, env = "VALID_PROXY_KEYS", value_delimiter = ',')]
    proxy_keys: Vec<String>,
    /// Seconds to wait for upstream response headers
    #[arg(long, env = "UPSTREAM_TIMEOUT")]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();
    env_logger::builder().init();
    if let Err(e) = dotenv {
        log::warn!("Cannot load .env file: {e}");
    }
    let args = Args::parse();

    let upstream_url = args.upstream.parse::<Uri>().expect("Cannot parse upstream URL");
    assert!(
        matches!(upstream_url.scheme_str(), Some("http" | "https")),
        "Upstream URL must be http or https"
    );
    assert!(upstream_url.authority().is_some(), "Upstream URL has no host");

    let config = Config {
        upstream_url,
        default_model: args.model,
        model_prefix: args.model_prefix,
        proxy_keys: args
            .proxy_keys
            .into_iter()
            .map(|key| key.trim().to_owned())
            .filter(|key| !key.is_empty())
            .collect(),
        timeout: args.timeout.map(Duration::from_secs),
    };
    log::info!(
        "Relaying to {} with default model {}",
        config.upstream_url,
        config.default_model
    );
    if !config.proxy_keys.is_empty() {
        log::info!("Proxy key check enabled ({} keys)", config.proxy_keys.len());
    }

    let upstream = HttpUpstream::new(config.upstream_url.clone())
        .expect("Cannot create upstream client")
        .timeout(config.timeout);

    let res = serve(
        args.addr,
        Router::new(NotFound).push("/v1/chat/completions", ChatRelay::new(upstream, &config)),
    )
    .await;
    if let Err(e) = res {
        log::error!("Error running server: {e}");
        panic!();
    }
}
