//! Instance bootstrap: the setup script and the remote execution that
//! applies it through the provider's command channel.

use crate::poller::{self, PollOutcome};
use crate::provider::{CloudProvider, CommandStatus};
use crate::network::APP_PORT;
use stack_common::{ProjectContext, ResourceKind, StageError, StageId};
use tracing::info;

/// Render the setup script the instance runs on first boot.
///
/// The script installs the runtime, pulls the application bundle from the
/// content bucket, and installs a service unit so the application survives
/// reboots. Secrets are read by the application at runtime through its
/// role; nothing sensitive is baked into the script.
pub fn render_setup_script(
    ctx: &ProjectContext,
    bucket: &str,
    knowledge_base_id: &str,
    collection_endpoint: &str,
) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail

dnf update -y
dnf install -y python3.11 python3.11-pip git

mkdir -p /opt/app
aws s3 sync s3://{bucket}/app/ /opt/app/ --region {region}
python3.11 -m venv /opt/app/venv
/opt/app/venv/bin/pip install --upgrade pip
if [ -f /opt/app/requirements.txt ]; then
  /opt/app/venv/bin/pip install -r /opt/app/requirements.txt
fi

cat > /etc/app.env <<ENV
APP_REGION={region}
APP_PROJECT={project}
APP_BUCKET={bucket}
APP_KNOWLEDGE_BASE_ID={knowledge_base_id}
APP_COLLECTION_ENDPOINT={collection_endpoint}
APP_WEATHER_SECRET={weather_secret}
APP_SEARCH_SECRET={search_secret}
ENV

cat > /etc/systemd/system/app.service <<UNIT
[Unit]
Description=Chat application
After=network.target

[Service]
EnvironmentFile=/etc/app.env
WorkingDirectory=/opt/app
ExecStart=/opt/app/venv/bin/streamlit run main.py --server.port {port} --server.address 0.0.0.0 --server.headless true
Restart=always
User=root

[Install]
WantedBy=multi-user.target
UNIT

systemctl daemon-reload
systemctl enable --now app.service
"#,
        bucket = bucket,
        region = ctx.region,
        project = ctx.project,
        knowledge_base_id = knowledge_base_id,
        collection_endpoint = collection_endpoint,
        weather_secret = ctx.weather_secret_name(),
        search_secret = ctx.search_secret_name(),
        port = APP_PORT,
    )
}

/// Run the setup script on the instance: wait for the command agent, issue
/// the command, and wait for it to finish.
pub async fn run(
    provider: &dyn CloudProvider,
    instance_id: &str,
    script: &str,
) -> Result<(), StageError> {
    let wrap = |e| StageError::new(StageId::Compute, ResourceKind::Instance, e);

    poller::await_ready(
        &format!("command agent on {instance_id}"),
        poller::AGENT,
        || async move {
            Ok(if provider.agent_ready(instance_id).await? {
                PollOutcome::Ready(())
            } else {
                PollOutcome::Pending
            })
        },
    )
    .await
    .map_err(wrap)?;

    let command_id = provider
        .send_command(instance_id, script)
        .await
        .map_err(wrap)?;
    info!(instance = instance_id, command = %command_id, "bootstrap command sent");

    poller::await_ready(
        &format!("bootstrap command {command_id}"),
        poller::COMMAND,
        || {
            let command_id = command_id.clone();
            async move {
                Ok(match provider.command_status(&command_id, instance_id).await? {
                    CommandStatus::Success => PollOutcome::Ready(()),
                    CommandStatus::InProgress => PollOutcome::Pending,
                    CommandStatus::Failed(reason) => PollOutcome::Failed(reason),
                })
            }
        },
    )
    .await
    .map_err(wrap)?;
    info!(instance = instance_id, "bootstrap complete");
    Ok(())
}
