use color_eyre::eyre::{Result, WrapErr, bail};
use duplexsrv::endpoint::DEFAULT_URL;
use duplexsrv::{Endpoint, UploadConfig, orchestrator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("duplexsrv=info")),
        )
        .init();

    // A single optional URL, no flags
    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
    if let Some(extra) = args.next() {
        bail!("Unexpected argument {extra:?}; usage: duplexsrv [URL]");
    }

    let endpoint = Endpoint::parse(&url).wrap_err_with(|| format!("Invalid endpoint {url:?}"))?;
    info!(%endpoint, "Starting full-duplex exchange");

    let report = orchestrator::run(&endpoint, UploadConfig::default())
        .await
        .wrap_err("Full-duplex exchange failed")?;

    info!(
        version = %report.version,
        status = %report.status,
        body = %String::from_utf8_lossy(&report.body),
        "Exchange complete"
    );
    Ok(())
}
