use anyhow::Result;
use clap::Parser;
use lockstat::{cli::Cli, session};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
///
/// `--debug` turns on everything; otherwise `RUST_LOG` alone decides.
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let Some(pid) = args.pid else {
        eprintln!("USAGE: lockstat <pid>");
        std::process::exit(1);
    };

    init_tracing(args.debug);

    let config = args.to_config()?;
    tracing::debug!(?config, "configuration");

    let mut stdout = std::io::stdout().lock();
    let outcome = session::run(pid, &config, &mut stdout)?;
    tracing::debug!(?outcome, "session finished");

    Ok(())
}
