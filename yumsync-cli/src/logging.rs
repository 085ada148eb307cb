use tracing::Level;
use tracing_subscriber::fmt;

use crate::cli::Args;

pub fn setup_logging(args: &Args) {
    let level = if args.quiet {
        Level::ERROR
    } else if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(format!("yumsync_core={level},yumsync_cli={level}"))
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}
