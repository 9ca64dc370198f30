use chatflow_config::Config;
use chatflow_conversation::{HostSettings, SessionHost};
use chatflow_providers::ChatCompletionsGateway;
use std::sync::Arc;
use tracing::{error, info};

use super::{CommandStrategy, open_journal};
use crate::server::HostApi;

/// Strategy for running the session host behind its HTTP API.
///
/// Runs until Ctrl-C, then stops every session run. Committed history and
/// summaries stay in the journal.
pub struct WorkerStrategy;

impl CommandStrategy for WorkerStrategy {
    type Input = ();

    async fn execute(&self, _input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load()?;
        info!("Loaded config from {}", Config::config_path()?.display());

        let gateway_config = &config.gateway;
        if gateway_config.api_key.is_empty() || gateway_config.api_key == "your-api-key-here" {
            anyhow::bail!("gateway.api_key is not set. Edit the config file created by 'chatflow init'.");
        }

        let mut gateway = ChatCompletionsGateway::new(gateway_config.api_key.clone())
            .with_base_url(gateway_config.base_url.clone())
            .with_model(gateway_config.model.clone())
            .with_request_timeout(gateway_config.request_timeout());
        if let Some(system_prompt) = &gateway_config.system_prompt {
            gateway = gateway.with_system_prompt(system_prompt.clone());
        }
        info!("Using model {}", gateway.model());

        let settings = HostSettings {
            session: config.session.session_config(),
            retry: config.session.call_retry.policy(),
            ..HostSettings::default()
        };
        let journal = open_journal(&config).await?;
        let host = SessionHost::new(Arc::new(gateway), journal, settings);

        let recovered = host.recover().await?;
        if recovered > 0 {
            info!("Recovered {recovered} sessions from the journal");
        }

        let listener = tokio::net::TcpListener::bind(config.host.listen_addr.as_str()).await?;
        let served = HostApi::serve(host.clone(), listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            info!("Ctrl-C received, stopping worker");
        })
        .await;

        host.shutdown().await;
        served
    }
}
