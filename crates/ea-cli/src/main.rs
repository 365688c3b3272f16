use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use ea_core::services::config_loader;
use ea_core::services::docker::DockerApiConnector;
use ea_core::services::registry::ServiceRegistry;
use ea_core::SystemClock;

use ea_cli::driver::Driver;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args: Vec<String> = std::env::args().collect();
    let debug = args.iter().any(|a| a == "--debug");
    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from)
    };
    let log_file = value_of("--log-file");
    let profiles_path = value_of("--profiles");
    let script = value_of("--script");

    let _guard = setup_logging(debug, log_file.as_deref());

    let profiles = match &profiles_path {
        Some(path) => config_loader::load(path)?,
        None => Vec::new(),
    };
    let registry = Arc::new(ServiceRegistry::new(
        Arc::new(DockerApiConnector::default()),
        Arc::new(SystemClock),
    ));
    let mut driver = Driver::new(registry, profiles);
    tracing::info!(
        profiles = ?driver.profile_ids().collect::<Vec<_>>(),
        "daemon_started"
    );

    let mut stdout = tokio::io::stdout();
    match script {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            run(&mut driver, BufReader::new(file), &mut stdout).await?;
        }
        None => run(&mut driver, BufReader::new(tokio::io::stdin()), &mut stdout).await?,
    }
    tracing::info!("daemon_stopped");
    Ok(())
}

/// Structured logs go to `log_file` when given, stderr otherwise; stdout
/// carries protocol responses only.
fn setup_logging(debug: bool, log_file: Option<&Path>) -> tracing_appender::non_blocking::WorkerGuard {
    let (writer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().unwrap_or(path.as_os_str());
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_ansi(false)
        .init();

    guard
}

async fn run<R, W>(driver: &mut Driver, input: BufReader<R>, output: &mut W) -> color_eyre::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(response) = driver.handle_line(&line).await {
            let mut json = serde_json::to_string(&response)?;
            json.push('\n');
            output.write_all(json.as_bytes()).await?;
            output.flush().await?;
        }
    }
    Ok(())
}
