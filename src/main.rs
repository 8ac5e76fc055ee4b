use clap::Parser;
use tracing_subscriber::EnvFilter;

use webctl::cli::{Cli, Command};
use webctl::daemon::{self, DaemonConfig};
use webctl::dispatch::{Executor, LocalExecutor, TcpExecutor};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WEBCTL_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Command::Daemon {
        browser_url,
        tcp,
        token,
        body_cap,
        buffer_cap,
    } = &cli.command
    {
        let config = DaemonConfig {
            browser_url: browser_url.clone(),
            tcp: tcp.clone(),
            token: token.clone(),
            body_cap: *body_cap,
            buffer_cap: *buffer_cap,
            ..DaemonConfig::default()
        };
        if let Err(err) = daemon::run(config).await {
            eprintln!("{err}");
            std::process::exit(1);
        }
        return;
    }

    let mut req = cli
        .command
        .to_request()
        .expect("non-daemon commands map to a request");
    req.debug = cli.debug;

    let reply = match &cli.remote {
        Some(addr) => {
            TcpExecutor::new(addr.clone(), cli.token.clone())
                .execute(req)
                .await
        }
        None => LocalExecutor::at_default_path().execute(req).await,
    };

    let ok = reply.ok;
    match serde_json::to_string(&reply) {
        Ok(line) => println!("{line}"),
        Err(err) => {
            eprintln!("unencodable reply: {err}");
            std::process::exit(1);
        }
    }
    if !ok {
        std::process::exit(1);
    }
}
