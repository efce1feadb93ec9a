use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use vpn_controller::config::Args;
use vpn_controller::controller::Controller;

fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )
    .unwrap();

    let args = Args::parse();
    if let Err(e) = args.validate() {
        tracing::error!("argument error: {:#}", e);
        std::process::exit(2);
    }
    tracing::info!(mode = ?args.mode(), "starting controller");

    let mut controller = match Controller::new(args) {
        Ok(controller) => controller,
        Err(e) => {
            tracing::error!("fatal configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.run() {
        tracing::error!("controller exited: {}", e);
        std::process::exit(1);
    }
}
