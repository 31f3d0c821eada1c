mod cli;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};

use cli::{Cli, Invocation};
use parget::progress::{ProgressFinish, ProgressReporter};
use parget::transfer::http::HttpSession;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli);

    debug!("CLI arguments: {:?}", cli);
    let invocation: Invocation = cli.try_into()?;

    let session = HttpSession::new(invocation.concurrent, invocation.speed_limit)
        .context("failed to set up HTTP session")?;
    session.limiter().promote();

    for request in invocation.requests {
        info!("getting {}", request.url);
        session.get(request)?;
    }

    let reporter = ProgressReporter::spawn(invocation.progress, session.tracker());
    let handle = session
        .run(false)
        .ok_or_else(|| anyhow!("session is already running"))?;
    handle.await.context("scheduler task failed")?;

    let finished = session.finished();
    let errors = session.errors();

    if let Some(reporter) = reporter {
        let finish = if errors.is_empty() {
            ProgressFinish::Success
        } else {
            ProgressFinish::Failure
        };
        reporter.finish(finish).await;
    }

    for sync in &finished {
        info!("saved to {}", sync.local_path().display());
    }

    if !errors.is_empty() {
        for sync in &errors {
            error!(
                "{} failed{}",
                sync.remote(),
                sync.error_message()
                    .map(|msg| format!(": {msg}"))
                    .unwrap_or_default()
            );
        }
        return Err(anyhow!("{} transfer(s) did not complete", errors.len()));
    }

    info!("all transfers completed");
    Ok(())
}

fn init_logger(cli: &Cli) {
    use env_logger::Env;
    use log::LevelFilter;

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    let level = if cli.silent {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    builder.filter_level(level);
    if !cli.verbose {
        builder.format_timestamp_secs();
    }
    let _ = builder.try_init();
}
