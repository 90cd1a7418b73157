//! Command handlers for the nmlink CLI

use std::path::Path;

use nmlink_core::commands::{
    delete_file_payload, report_config_payload, reset_payload, rtc_payload, turn_payload,
    upgrade_payload, work_mode_payload,
};
use nmlink_core::{
    ControlModule, ControlResponse, DeviceTarget, ReportConfig, ResetKind, RtcSetting,
    StoredFile, SubscriptionFilter, TransferEvent, TransferFile, TurnCommand,
};
use nmlink_relay::ConsoleClient;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::cli::{parse_payload, Commands, FileKind, TargetArgs};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// A catalogued module ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest<'a> {
    pub module: ControlModule,
    pub payload: Value,
    pub target: &'a TargetArgs,
}

/// Map a device command onto its control module and payload
///
/// Returns `None` for commands that are not a single catalogued request.
pub fn control_request(command: &Commands) -> Result<Option<ControlRequest<'_>>> {
    let (module, payload, target) = match command {
        Commands::Status
        | Commands::Query { .. }
        | Commands::Upload { .. }
        | Commands::Watch { .. } => return Ok(None),
        Commands::Version { target } => (ControlModule::QueryVersion, json!({}), target),
        Commands::Rtc { target } => (ControlModule::QueryRtc, json!({}), target),
        Commands::DeviceStatus { target } => {
            (ControlModule::QueryDeviceStatus, json!({}), target)
        }
        Commands::ReportConfig { target } => {
            (ControlModule::QueryReportConfig, json!({}), target)
        }
        Commands::SetRtc { datetime, target } => {
            let setting = RtcSetting::from_datetime(datetime).ok_or_else(|| {
                CliError::InvalidArgument(format!(
                    "expected YYYY-MM-DDTHH:MM, got {}",
                    datetime
                ))
            })?;
            (ControlModule::SetRtc, rtc_payload(&setting), target)
        }
        Commands::SetReportConfig {
            report_ip,
            report_port,
            mode,
            interval,
            target,
        } => {
            let report = ReportConfig {
                ip: report_ip.clone(),
                port: report_port.clone(),
                mode: mode.clone(),
                interval: interval.clone(),
            };
            (
                ControlModule::SetReportConfig,
                report_config_payload(&report),
                target,
            )
        }
        Commands::Reset { soft, target } => {
            let kind = if *soft { ResetKind::Soft } else { ResetKind::Task };
            (ControlModule::AduRst, reset_payload(kind), target)
        }
        Commands::Files { target } => (ControlModule::UploadFileList, json!({}), target),
        Commands::DeleteFile {
            file_id,
            path_name,
            target,
        } => {
            let file = StoredFile {
                file_id: file_id.clone(),
                path_name: path_name.clone(),
            };
            (
                ControlModule::UploadFileDelete,
                delete_file_payload(&file),
                target,
            )
        }
        Commands::Upgrade { file_id, target } => (
            ControlModule::SoftwareUpgrade,
            upgrade_payload(file_id),
            target,
        ),
        Commands::Turn {
            axis,
            direction,
            angle,
            mode,
            target,
        } => {
            let turn = TurnCommand {
                mode: *mode,
                axis: (*axis).into(),
                direction: (*direction).into(),
                angle: *angle,
            };
            (ControlModule::TurnControl, turn_payload(&turn)?, target)
        }
        Commands::WorkMode { target } => (ControlModule::QueryWorkMode, json!({}), target),
        Commands::SetWorkMode { pattern, target } => (
            ControlModule::SetWorkMode,
            work_mode_payload(pattern),
            target,
        ),
    };

    Ok(Some(ControlRequest {
        module,
        payload,
        target,
    }))
}

/// Progress line for a transfer event
///
/// Failures are left to the returned error.
pub fn describe_transfer_event(event: &TransferEvent) -> Option<String> {
    match event {
        TransferEvent::Started {
            file_id,
            total_size,
            total_chunks,
        } => Some(format!(
            "Uploading {} ({} bytes, {} chunks)",
            file_id, total_size, total_chunks
        )),
        TransferEvent::Progress {
            chunk_index,
            percent,
        } => Some(format!(
            "  chunk {} acknowledged, {}%",
            chunk_index, percent
        )),
        TransferEvent::ChunkRetry {
            chunk_index,
            attempt,
            reason,
        } => Some(format!(
            "  chunk {} failed ({}), retry {}",
            chunk_index, reason, attempt
        )),
        TransferEvent::Completed(_) => Some("Upload complete".to_string()),
        TransferEvent::Failed(_) => None,
    }
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Connect to the relay and execute one command
    pub async fn execute(command: Commands, config: AppConfig) -> Result<()> {
        let mut client = ConsoleClient::connect(config.console.clone())?;

        if let Commands::Status = command {
            let result = Self::handle_status_command(&client, &config).await;
            client.shutdown();
            return result;
        }

        // Reject bad arguments before waiting on the relay.
        let request = control_request(&command)?;

        client.wait_until_open(config.connect_timeout()).await?;
        let result = match (request, &command) {
            (Some(request), _) => Self::handle_known(&client, request).await,
            (
                None,
                Commands::Query {
                    module,
                    payload,
                    target,
                },
            ) => {
                let payload = parse_payload(payload)?;
                Self::handle_query(&client, module, payload, target).await
            }
            (
                None,
                Commands::Upload {
                    path,
                    file_type,
                    target,
                },
            ) => Self::handle_upload_command(&client, path, *file_type, target).await,
            (None, Commands::Watch { kind, device }) => {
                Self::handle_watch_command(&client, kind.clone(), device.clone()).await
            }
            (None, _) => Ok(()),
        };

        client.shutdown();
        result
    }

    /// Handle the status command
    async fn handle_status_command(client: &ConsoleClient, config: &AppConfig) -> Result<()> {
        if let Err(e) = client.wait_until_open(config.connect_timeout()).await {
            warn!("{}", e);
        }

        println!("nmlink Relay Status");
        println!("===================");
        println!("Relay:            {}", client.channel().url());
        println!("State:            {}", client.state());
        println!(
            "Reconnect delay:  {}ms",
            config.console.reconnect_delay_ms
        );
        println!(
            "Response timeout: {}",
            config
                .console
                .request_timeout_ms
                .map_or_else(|| "none".to_string(), |ms| format!("{}ms", ms))
        );
        println!(
            "Chunking:         {} bytes, {} attempts per chunk",
            config.console.chunk_size_bytes, config.console.max_chunk_retries
        );
        println!("Pending requests: {}", client.multiplexer().pending_count());
        Ok(())
    }

    /// Handle a free-form module query
    async fn handle_query(
        client: &ConsoleClient,
        module: &str,
        payload: Value,
        target: &TargetArgs,
    ) -> Result<()> {
        let target = target.to_target()?;
        if module.parse::<ControlModule>().is_err() {
            warn!("{} is not a known control module, sending anyway", module);
        }
        let response = client.call(module, payload, &target)?.await?;
        Self::print_response(&target, response)
    }

    /// Handle one of the catalogued modules
    async fn handle_known(client: &ConsoleClient, request: ControlRequest<'_>) -> Result<()> {
        let target = request.target.to_target()?;
        info!("Sending {} to {}", request.module, target);
        let response = client
            .request(request.module, request.payload, &target)
            .await?;
        Self::print_response(&target, response)
    }

    /// Handle the upload command
    async fn handle_upload_command(
        client: &ConsoleClient,
        path: &Path,
        file_type: FileKind,
        target: &TargetArgs,
    ) -> Result<()> {
        let target = target.to_target()?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                CliError::InvalidArgument(format!("{} has no file name", path.display()))
            })?
            .to_string();
        let data = tokio::fs::read(path).await?;
        let file = TransferFile::new(name, file_type.as_str(), data);

        let report = client
            .upload(&target, file, |event| {
                if let Some(line) = describe_transfer_event(event) {
                    println!("{}", line);
                }
            })
            .await?;

        println!(
            "{} delivered to {} in {} chunks ({} retries)",
            report.file_name, target, report.total_chunks, report.retries
        );
        Ok(())
    }

    /// Handle the watch command
    async fn handle_watch_command(
        client: &ConsoleClient,
        kind: Option<String>,
        device: Option<String>,
    ) -> Result<()> {
        let filter = SubscriptionFilter {
            kind,
            device_serial: device,
        };
        let (handle, mut frames) = client.subscribe_channel(filter);
        println!("Watching push frames, press Ctrl-C to stop");

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    println!("{}", serde_json::to_string(&frame.body)?);
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        client.unsubscribe(handle);
        Ok(())
    }

    fn print_response(target: &DeviceTarget, response: ControlResponse) -> Result<()> {
        let module = response.module.clone();
        let data = response.into_result()?;
        println!("{} from {}:", module, target);
        println!("{}", serde_json::to_string_pretty(&data)?);
        Ok(())
    }
}
