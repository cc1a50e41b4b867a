//! rstream entry point: parse arguments, set up the process, run one of
//! the two engines until a termination signal arrives.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use rstream::cli::{expand_sources, Args};
use rstream::client::{self, ClientConfig};
use rstream::daemon;
use rstream::server::{self, ServerConfig};

fn main() {
    let args = Args::parse();
    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("rstream: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    // Configuration problems are fatal before anything detaches.
    if !args.dir.is_dir() {
        bail!("{} is not a directory", args.dir.display());
    }
    regex::Regex::new(&args.include)
        .with_context(|| format!("include regex {:?}", args.include))?;
    let sources = expand_sources(&args.sources);
    if args.listen && !sources.is_empty() {
        bail!("server mode takes no source hosts");
    }
    if !args.listen && sources.is_empty() {
        bail!("client mode needs at least one source host");
    }

    if !args.foreground {
        daemon::daemonize()?;
    }

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("install logger")?;

    daemon::write_pid_file(&args.pid_file)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    let code = runtime.block_on(async {
        let engine = if args.listen {
            tokio::spawn(server::serve(ServerConfig {
                port: args.port,
                root: args.dir.clone(),
                include: args.include.clone(),
                compress: args.compress,
                checksums: args.checksums,
            }))
        } else {
            tokio::spawn(client::run(ClientConfig {
                port: args.port,
                dir: args.dir.clone(),
                sources,
                echo_stdout: args.stdout_copy,
            }))
        };
        tokio::select! {
            res = engine => match res {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    error!("engine failed: {e:#}");
                    eprintln!("rstream: {e:#}");
                    1
                }
                Err(e) => {
                    error!("engine panicked: {e}");
                    1
                }
            },
            res = daemon::wait_for_shutdown() => {
                match res {
                    Ok(()) => info!("shutting down"),
                    Err(e) => error!("signal handling failed: {e:#}"),
                }
                0
            }
        }
    });
    daemon::remove_pid_file(&args.pid_file);
    Ok(code)
}
