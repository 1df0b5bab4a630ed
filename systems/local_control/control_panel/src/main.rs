//! Control panel binary
use clap::Parser;
use ctrlpanel::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Control Panel Component.
    #[arg(short, long)]
    filepath: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ctrlpanel=info,control_panel=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let component = ControlPanel::from_config_file(&args.filepath)?;
    tracing::info!(uuid = %component.uuid(), config = %args.filepath, "starting control panel");
    ControlPanelController::start(component).await?;
    Ok(())
}
