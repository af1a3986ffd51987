//! Brings up the match server once a veto finishes.
//!
//! Three commands run in one authenticated console session: the connect
//! password, the live config and the level change. A failed launch is
//! logged and left for an operator; the finished veto is not rolled back.

use crate::coordinator::LaunchRequest;
use crate::store::LobbyStore;
use client::rcon::{self, RconError};
use log::{error, info, warn};
use shared::ServerTarget;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Server config executed before the level change.
pub const LIVE_CONFIG: &str = "live";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid control address '{0}'")]
    InvalidAddress(String),
    #[error("failed to start server: {0}")]
    Rcon(#[from] RconError),
}

/// Engine level name for a pool entry. Display names gain the `de_`
/// prefix; names that already look like level names pass through.
pub fn level_name(map: &str) -> String {
    if map.contains('_') {
        map.to_string()
    } else {
        format!("de_{}", map.to_lowercase())
    }
}

/// Commands that open the server for the match, in execution order.
pub fn launch_commands(final_map: &str, connect_password: &str) -> Vec<String> {
    let password: String = connect_password
        .chars()
        .filter(|c| !matches!(c, '"' | ';' | '\n' | '\r'))
        .collect();
    vec![
        format!("sv_password \"{}\"", password),
        format!("exec {}", LIVE_CONFIG),
        format!("changelevel {}", level_name(final_map)),
    ]
}

#[derive(Debug, Clone)]
pub struct Launcher {
    rcon_timeout: Duration,
}

impl Launcher {
    pub fn new(rcon_timeout: Duration) -> Self {
        Self { rcon_timeout }
    }

    pub async fn launch(
        &self,
        target: &ServerTarget,
        final_map: &str,
        connect_password: &str,
    ) -> Result<(), LaunchError> {
        let commands = launch_commands(final_map, connect_password);
        self.execute(target, &commands).await?;
        info!(
            "Match server {} switched to {}",
            target.control_address,
            level_name(final_map)
        );
        Ok(())
    }

    /// Operator escape hatch: runs one console command and returns its output.
    pub async fn run_command(
        &self,
        target: &ServerTarget,
        command: &str,
    ) -> Result<String, LaunchError> {
        let mut responses = self.execute(target, &[command.to_string()]).await?;
        Ok(responses.pop().unwrap_or_default())
    }

    async fn execute(
        &self,
        target: &ServerTarget,
        commands: &[String],
    ) -> Result<Vec<String>, LaunchError> {
        let (host, port) = target
            .host_port()
            .ok_or_else(|| LaunchError::InvalidAddress(target.control_address.clone()))?;
        Ok(rcon::execute(host, port, &target.rcon_password, commands, self.rcon_timeout).await?)
    }
}

/// Serves launch requests until every sender is dropped.
pub async fn run_launch_worker(
    mut requests: mpsc::UnboundedReceiver<LaunchRequest>,
    store: Arc<dyn LobbyStore>,
    launcher: Launcher,
    default_password: String,
) {
    while let Some(request) = requests.recv().await {
        let settings = match store.lobby(request.lobby) {
            Ok(lobby) => lobby.settings,
            Err(e) => {
                error!("Cannot launch lobby {}: {}", request.lobby, e);
                continue;
            }
        };
        let Some(target) = settings.server else {
            warn!(
                "Lobby {} finished on {} but has no game server bound",
                request.lobby, request.final_map
            );
            continue;
        };
        let password = settings.connect_password.unwrap_or_else(|| default_password.clone());

        if let Err(e) = launcher
            .launch(&target, &request.final_map, &password)
            .await
        {
            error!("Lobby {}: {}", request.lobby, e);
        }
    }
    info!("Launch worker stopping");
}
