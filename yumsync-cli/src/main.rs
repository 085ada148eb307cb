use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use yumsync_core::{config::Yumfile, engine::Engine, error::Error};

mod cli;
mod logging;
mod progress;

use cli::{Args, Commands};

async fn run(args: Args) -> yumsync_core::Result<()> {
    match args.command {
        Commands::Validate => {
            let yumfile = Yumfile::load(&args.file)?;
            println!("Yumfile appears valid ({} repos)", yumfile.repos.len());
            Ok(())
        }
        Commands::List => {
            let yumfile = Yumfile::load(&args.file)?;
            let count = yumfile.repos.len();
            let padding = count.to_string().len() * 2 + 1;
            for (i, repo) in yumfile.repos.iter().enumerate() {
                println!(
                    "{:>width$} {}",
                    format!("{}/{}", i + 1, count),
                    repo.id,
                    width = padding
                );
            }
            Ok(())
        }
        Commands::Sync { repo_id } => {
            let yumfile = Yumfile::load(&args.file)?;
            let mut engine = Engine::new(yumfile, &args.cache)?.parallel(args.parallel);
            if !args.quiet {
                engine = engine.on_progress(progress::progress_callback());
            }

            // installed once at startup; everything downstream listens on
            // the engine's cancellation token
            let cancel = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, finishing in-flight work");
                    cancel.cancel();
                }
            });

            match repo_id {
                Some(id) => engine.sync_one(&id).await.map(|_| ()),
                None => engine.sync_all().await,
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::setup_logging(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Interrupted) => {
            error!("Interrupted");
            ExitCode::from(2)
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
