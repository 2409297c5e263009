use bayctl::commands::{self, Command, USAGE};
use bayctl::config::{get_config_path, Config};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = std::env::args().nth(1).as_deref().and_then(Command::parse) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = Config::load_or_default(&get_config_path());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(command, &config))
}
