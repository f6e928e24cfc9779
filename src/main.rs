use clap::Parser;

/// ssh-bastion proxies SSH sessions to tenant VMs, auditing every shell
/// command along the way. There is no CLI surface beyond start-up: the
/// single argument is a TOML config file (spec.md §6).
#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
    /// path to the TOML configuration file
    config_file: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = ssh_bastion::config::Config::load(&args.config_file)?;

    ssh_bastion::run(config).await
}
