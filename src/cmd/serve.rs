//! Actions server command: `forge-actions serve`.

use anyhow::Result;

use forge_actions::actions::server::{ServerConfig, start_server};
use forge_actions::config::ActionsConfig;

pub async fn cmd_serve(config: &ActionsConfig, dev: bool) -> Result<()> {
    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }

    start_server(ServerConfig {
        host: config.host().to_string(),
        port: config.port(),
        db_path: config.db_path(),
        dev_mode: dev,
        settings: config.settings(),
    })
    .await
}
