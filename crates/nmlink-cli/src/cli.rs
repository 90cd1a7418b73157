//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use nmlink_core::{DeviceTarget, TurnAxis, TurnDirection};

use crate::error::{CliError, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Relay WebSocket URL
    #[arg(short, long)]
    pub relay: Option<String>,

    /// Seconds to wait for each response
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds to wait for the relay connection
    #[arg(long)]
    pub connect_timeout: Option<u64>,
}

/// Terminal addressing shared by every device command
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TargetArgs {
    /// Terminal serial number
    #[arg(long)]
    pub sn: String,

    /// Terminal address as known to the relay
    #[arg(long)]
    pub ip: String,

    /// Terminal port as known to the relay
    #[arg(long)]
    pub port: u16,
}

impl TargetArgs {
    pub fn to_target(&self) -> Result<DeviceTarget> {
        Ok(DeviceTarget::new(&self.sn, &self.ip, self.port)?)
    }
}

/// Firmware image kinds accepted by `upload`
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Antenna control unit
    Acu,
    /// Antenna drive unit
    Adu,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acu => "acu",
            Self::Adu => "adu",
        }
    }
}

/// Axis moved by `turn`
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisArg {
    Azimuth,
    Elevation,
    /// Incremental mode only
    Polarization,
    Roll,
}

impl From<AxisArg> for TurnAxis {
    fn from(axis: AxisArg) -> Self {
        match axis {
            AxisArg::Azimuth => Self::Azimuth,
            AxisArg::Elevation => Self::Elevation,
            AxisArg::Polarization => Self::Polarization,
            AxisArg::Roll => Self::Roll,
        }
    }
}

/// Direction of a `turn`
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionArg {
    /// Up, right or clockwise
    Positive,
    /// Down, left or counter-clockwise
    Negative,
}

impl From<DirectionArg> for TurnDirection {
    fn from(direction: DirectionArg) -> Self {
        match direction {
            DirectionArg::Positive => Self::Positive,
            DirectionArg::Negative => Self::Negative,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show relay connection status
    Status,
    /// Send any control module and print the response
    Query {
        /// Module name, e.g. query_rtc
        module: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Query the firmware version
    Version {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Query the terminal clock
    Rtc {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Query the terminal's device status
    DeviceStatus {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Query where and how often the terminal reports
    ReportConfig {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Set the terminal clock
    SetRtc {
        /// Local time as YYYY-MM-DDTHH:MM
        #[arg(long)]
        datetime: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Change the terminal's report destination and interval
    SetReportConfig {
        /// Collector address
        #[arg(long)]
        report_ip: String,
        /// Collector port
        #[arg(long)]
        report_port: String,
        /// Report transport mode
        #[arg(long)]
        mode: String,
        /// Report interval in seconds
        #[arg(long)]
        interval: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Reset the antenna task, or the whole unit with --soft
    Reset {
        #[arg(long)]
        soft: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List files stored on the terminal
    Files {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Delete a stored file from the terminal
    DeleteFile {
        /// Identifier listed by `files`
        #[arg(long)]
        file_id: String,
        /// Path listed by `files`
        #[arg(long)]
        path_name: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Upgrade the terminal from a stored firmware image
    Upgrade {
        /// Identifier listed by `files`
        #[arg(long)]
        file_id: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Rotate the antenna manually
    Turn {
        #[arg(long, value_enum)]
        axis: AxisArg,
        #[arg(long, value_enum)]
        direction: DirectionArg,
        /// Degrees to rotate
        #[arg(long)]
        angle: f64,
        /// Adjustment mode code
        #[arg(long, default_value_t = 0)]
        mode: u8,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Query the terminal's work mode
    WorkMode {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Change the terminal's work mode
    SetWorkMode {
        #[arg(long)]
        pattern: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Push a firmware image to the terminal
    Upload {
        /// File to send
        path: PathBuf,
        /// Firmware image kind
        #[arg(long, value_enum)]
        file_type: FileKind,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print push frames until interrupted
    Watch {
        /// Only frames of this type
        #[arg(long)]
        kind: Option<String>,
        /// Only frames about this serial number
        #[arg(long)]
        device: Option<String>,
    },
}

/// Parse a `--payload` argument
pub fn parse_payload(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(CliError::InvalidArgument(
            "payload must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_command() {
        let cli = Cli::try_parse_from([
            "nmlink",
            "query",
            "query_rtc",
            "--sn",
            "SN1",
            "--ip",
            "10.0.0.2",
            "--port",
            "6000",
        ])
        .unwrap();

        match cli.command {
            Commands::Query {
                module,
                payload,
                target,
            } => {
                assert_eq!(module, "query_rtc");
                assert_eq!(payload, "{}");
                assert_eq!(target.to_target().unwrap().to_string(), "SN1@10.0.0.2:6000");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_upload_requires_file_type() {
        let missing = Cli::try_parse_from([
            "nmlink", "upload", "fw.bin", "--sn", "SN1", "--ip", "10.0.0.2", "--port", "6000",
        ]);
        assert!(missing.is_err());

        let cli = Cli::try_parse_from([
            "nmlink",
            "upload",
            "fw.bin",
            "--file-type",
            "adu",
            "--sn",
            "SN1",
            "--ip",
            "10.0.0.2",
            "--port",
            "6000",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Upload {
                file_type: FileKind::Adu,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_serial_is_rejected() {
        let target = TargetArgs {
            sn: String::new(),
            ip: "10.0.0.2".to_string(),
            port: 6000,
        };
        assert!(matches!(target.to_target(), Err(CliError::Control(_))));
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(parse_payload(r#"{"rst_type": 1}"#).is_ok());
        assert!(parse_payload("[1]").is_err());
        assert!(parse_payload("nope").is_err());
    }

    const TARGET: [&str; 6] = ["--sn", "SN1", "--ip", "10.0.0.2", "--port", "6000"];

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        let mut argv = vec!["nmlink"];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&TARGET);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn test_every_device_command_parses() {
        let commands: [&[&str]; 14] = [
            &["query", "query_version"],
            &["version"],
            &["rtc"],
            &["device-status"],
            &["report-config"],
            &["set-rtc", "--datetime", "2024-05-01T08:30"],
            &[
                "set-report-config",
                "--report-ip",
                "10.0.0.1",
                "--report-port",
                "9000",
                "--mode",
                "udp",
                "--interval",
                "5",
            ],
            &["reset", "--soft"],
            &["files"],
            &["delete-file", "--file-id", "f1", "--path-name", "/mnt/f1"],
            &["upgrade", "--file-id", "f1"],
            &[
                "turn",
                "--axis",
                "elevation",
                "--direction",
                "negative",
                "--angle",
                "12.5",
            ],
            &["work-mode"],
            &["set-work-mode", "--pattern", "2"],
        ];
        for args in commands {
            assert!(parse(args).is_ok(), "failed to parse {:?}", args);
        }
    }

    #[test]
    fn test_device_commands_require_target() {
        assert!(Cli::try_parse_from(["nmlink", "version", "--sn", "SN1"]).is_err());
        assert!(Cli::try_parse_from(["nmlink", "files", "--ip", "10.0.0.2", "--port", "6000"])
            .is_err());
        assert!(Cli::try_parse_from([
            "nmlink", "rtc", "--sn", "SN1", "--ip", "10.0.0.2", "--port", "70000"
        ])
        .is_err());
    }

    #[test]
    fn test_status_and_watch_need_no_target() {
        assert!(matches!(
            Cli::try_parse_from(["nmlink", "status"]).unwrap().command,
            Commands::Status
        ));
        let cli = Cli::try_parse_from(["nmlink", "watch", "--kind", "state_report"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Watch { kind: Some(ref kind), device: None } if kind == "state_report"
        ));
    }

    #[test]
    fn test_turn_arguments() {
        let cli = parse(&["turn", "--axis", "roll", "--direction", "positive", "--angle", "3"])
            .unwrap();
        match cli.command {
            Commands::Turn {
                axis,
                direction,
                angle,
                mode,
                ..
            } => {
                assert_eq!(TurnAxis::from(axis), TurnAxis::Roll);
                assert_eq!(TurnDirection::from(direction), TurnDirection::Positive);
                assert_eq!(angle, 3.0);
                assert_eq!(mode, 0);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(parse(&["turn", "--axis", "pitch", "--direction", "positive", "--angle", "3"])
            .is_err());
    }

    #[test]
    fn test_payload_parse_errors_are_classified() {
        assert!(matches!(
            parse_payload("{oops"),
            Err(CliError::Serialization(_))
        ));
        assert!(matches!(
            parse_payload("\"text\""),
            Err(CliError::InvalidArgument(_))
        ));
    }
}
