use std::time::Instant;

use apifarm::client::ApiPoolClient;
use apifarm::config::Config;
use apifarm::report::BatchReport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Missing .env is fine; explicit environment still applies.
    dotenvy::dotenv().ok();

    let config = Config::load()?;
    tracing::info!(?config, "apifarm stress run starting");

    let client = ApiPoolClient::from_config(&config)?;

    println!(
        "\nStarting stress test with {} requests (concurrency: {})...",
        config.requests, config.concurrency
    );

    let start = Instant::now();
    let outcomes = client
        .batch_chat_completions(
            config.stress_messages(),
            &config.model,
            config.temperature,
            config.max_tokens,
            config.concurrency,
            config.timeout,
        )
        .await?;

    let report = BatchReport::from_outcomes(&outcomes, start.elapsed());
    print!("{report}");

    if report.total != config.requests {
        anyhow::bail!(
            "expected {} responses, got {}",
            config.requests,
            report.total
        );
    }
    if !report.all_succeeded() {
        anyhow::bail!(
            "only {}/{} requests succeeded",
            report.succeeded,
            config.requests
        );
    }

    tracing::info!("apifarm stress run finished");
    Ok(())
}
