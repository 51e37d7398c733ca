use clap::Parser;
use powercycle::cli::Cli;

mod cmd;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // The agent logs to stdout so the driver captures its output.
    let log_file = if cli.is_agent() { None } else { cli.log_file.as_deref() };
    let guard = match powercycle::logging::init(&cli.log_level, log_file) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    };

    let code = if cli.is_agent() {
        cmd::run_agent(&cli).await
    } else {
        cmd::run_driver(&cli).await
    };

    drop(guard);
    std::process::exit(code);
}
