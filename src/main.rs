//! Coordination service binary. Runs until terminated; exits non-zero when
//! the helper port cannot be bound.

use m1_system_helper::{HelperConfig, HelperService, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = HelperConfig::load(&HelperConfig::default_path());
    tracing::info!(
        helper_port = config.helper_port,
        server_port = config.server_port,
        "starting coordination service"
    );

    let service = HelperService::start(config)?;
    service.wait();
    Ok(())
}
