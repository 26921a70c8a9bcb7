//! CLI entry point for the bakery client.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bakery_client::{
    Bakery, BakeryConfig, FileStore, HttpTransport, KeyValueStore, MemoryStore, RequestError,
    ReqwestTransport,
};
use clap::Parser;
use reqwest::Method;
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

const AUTH_ENV: &str = "BAKERY_AUTH";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let bakery = build_bakery(&args)?;

    let (method, url, data, no_redirect) = match args.command {
        Command::Logout => {
            bakery.clear_cookie().context("cannot clear stored credentials")?;
            info!(service = %args.service, "logged out");
            return Ok(());
        }
        Command::Get(read) => (Method::GET, read.url, None, read.no_redirect),
        Command::Delete(read) => (Method::DELETE, read.url, None, read.no_redirect),
        Command::Post(write) => (Method::POST, write.url, Some(write.data), write.no_redirect),
        Command::Put(write) => (Method::PUT, write.url, Some(write.data), write.no_redirect),
        Command::Patch(write) => (Method::PATCH, write.url, Some(write.data), write.no_redirect),
    };

    match bakery
        .send_request(method, &url, data.as_deref(), !no_redirect)
        .await
    {
        Ok(response) => {
            println!("{}", response.body);
            Ok(())
        }
        Err(RequestError::Status { url, response }) => {
            if !response.body.is_empty() {
                println!("{}", response.body);
            }
            bail!("request to {url} failed with status {}", response.status)
        }
        Err(e) => Err(e).context(format!("request to {url} failed")),
    }
}

fn build_bakery(args: &Args) -> Result<Bakery> {
    let mut transport = ReqwestTransport::new()?;
    if let Some(base_url) = &args.base_url {
        transport = transport.with_base_url(base_url)?;
    }
    let transport: Arc<dyn HttpTransport> = Arc::new(transport);

    let store: Arc<dyn KeyValueStore> = if args.persist {
        let file = FileStore::open_default().context("cannot open credential file")?;
        debug!(path = %file.path().display(), "using persistent credential store");
        Arc::new(file)
    } else {
        Arc::new(MemoryStore::new())
    };

    let mut config = BakeryConfig::new(&args.service);
    config.set_cookie_path.clone_from(&args.set_cookie_path);
    config.interactive = !args.non_interactive;
    config.login_method.clone_from(&args.login_method);
    config.auth = env::var(AUTH_ENV)
        .ok()
        .filter(|auth| !auth.trim().is_empty())
        .map(|auth| serde_json::from_str(&auth).unwrap_or(serde_json::Value::String(auth)));

    let bakery = Bakery::builder(config)
        .transport(transport)
        .store(store)
        .build()?;
    Ok(bakery)
}
