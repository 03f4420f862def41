use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = refereectl::Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = refereectl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
