//! Control module catalogue
//!
//! Names and payload shapes of the terminal operations the console issues.
//! The multiplexer accepts any module name; these helpers only keep callers
//! from misspelling the common ones.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::ControlError;

// ----------------------------------------------------------------------------
// Module Names
// ----------------------------------------------------------------------------

/// Control modules understood by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlModule {
    QueryDeviceStatus,
    QueryVersion,
    QueryRtc,
    SetRtc,
    QueryReportConfig,
    SetReportConfig,
    AduRst,
    UploadFileList,
    UploadFileInit,
    UploadFileChunk,
    UploadFileComplete,
    UploadFileDelete,
    SoftwareUpgrade,
    TurnControl,
    QueryWorkMode,
    SetWorkMode,
}

impl ControlModule {
    /// Wire name of the module
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryDeviceStatus => "query_device_status",
            Self::QueryVersion => "query_version",
            Self::QueryRtc => "query_rtc",
            Self::SetRtc => "set_rtc",
            Self::QueryReportConfig => "query_report_config",
            Self::SetReportConfig => "set_report_config",
            Self::AduRst => "adu_rst",
            Self::UploadFileList => "upload_file_list",
            Self::UploadFileInit => "upload_file_init",
            Self::UploadFileChunk => "upload_file_chunk",
            Self::UploadFileComplete => "upload_file_complete",
            Self::UploadFileDelete => "upload_file_delete",
            Self::SoftwareUpgrade => "software_upgrade",
            Self::TurnControl => "turn_control",
            Self::QueryWorkMode => "query_work_mode",
            Self::SetWorkMode => "set_work_mode",
        }
    }

    /// Every known module
    pub fn all() -> &'static [ControlModule] {
        &[
            Self::QueryDeviceStatus,
            Self::QueryVersion,
            Self::QueryRtc,
            Self::SetRtc,
            Self::QueryReportConfig,
            Self::SetReportConfig,
            Self::AduRst,
            Self::UploadFileList,
            Self::UploadFileInit,
            Self::UploadFileChunk,
            Self::UploadFileComplete,
            Self::UploadFileDelete,
            Self::SoftwareUpgrade,
            Self::TurnControl,
            Self::QueryWorkMode,
            Self::SetWorkMode,
        ]
    }
}

impl fmt::Display for ControlModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlModule {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|module| module.as_str() == s)
            .ok_or_else(|| ControlError::InvalidFrame(format!("unknown control module: {}", s)))
    }
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

/// Reset flavours accepted by `adu_rst`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Restart the antenna control task
    Task,
    /// Soft reset of the whole unit
    Soft,
}

impl ResetKind {
    /// Value of `rst_type` on the wire
    pub fn code(&self) -> u8 {
        match self {
            Self::Task => 0,
            Self::Soft => 1,
        }
    }
}

/// Payload of `set_rtc`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcSetting {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM[:SS]`
    pub time: String,
}

impl RtcSetting {
    /// Split an HTML-style `YYYY-MM-DDTHH:MM` value
    pub fn from_datetime(value: &str) -> Option<Self> {
        let (date, time) = value.split_once('T')?;
        if date.is_empty() || time.is_empty() {
            return None;
        }
        Some(Self {
            date: date.to_string(),
            time: time.to_string(),
        })
    }
}

/// Payload of `set_report_config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Collector address the terminal reports to
    pub ip: String,
    /// Collector port
    pub port: String,
    /// Report transport mode
    pub mode: String,
    /// Report interval in seconds
    pub interval: String,
}

/// Rotation axis of `turn_control`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAxis {
    Azimuth,
    Elevation,
    /// Only honoured in incremental mode
    Polarization,
    Roll,
}

impl TurnAxis {
    /// Value of `axis` on the wire
    pub fn code(&self) -> u8 {
        match self {
            Self::Azimuth => 0,
            Self::Elevation => 1,
            Self::Polarization => 2,
            Self::Roll => 3,
        }
    }

    /// Largest rotation, in degrees either way, accepted for this axis
    pub fn angle_limit(&self) -> f64 {
        match self {
            Self::Azimuth | Self::Polarization => 360.0,
            Self::Elevation => 90.0,
            Self::Roll => 100.0,
        }
    }
}

/// Rotation direction of `turn_control`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDirection {
    /// Up, right or clockwise
    Positive,
    /// Down, left or counter-clockwise
    Negative,
}

impl TurnDirection {
    /// Value of `direct` on the wire
    pub fn code(&self) -> u8 {
        match self {
            Self::Positive => 0,
            Self::Negative => 1,
        }
    }
}

/// Manual antenna rotation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnCommand {
    /// Adjustment mode selected on the console
    pub mode: u8,
    pub axis: TurnAxis,
    pub direction: TurnDirection,
    /// Degrees
    pub angle: f64,
}

/// Firmware image stored on the terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// Identifier reported by `upload_file_list`
    pub file_id: String,
    /// Path of the image on the terminal
    pub path_name: String,
}

/// Payload of `adu_rst`
pub fn reset_payload(kind: ResetKind) -> Value {
    json!({ "rst_type": kind.code() })
}

/// Payload of `set_rtc`
pub fn rtc_payload(setting: &RtcSetting) -> Value {
    json!({ "date": setting.date, "time": setting.time })
}

/// Payload of `set_report_config`
pub fn report_config_payload(config: &ReportConfig) -> Value {
    json!({
        "ip": config.ip,
        "port": config.port,
        "mode": config.mode,
        "interval": config.interval,
    })
}

/// Payload of `upload_file_delete`
pub fn delete_file_payload(file: &StoredFile) -> Value {
    json!({ "fileId": file.file_id, "pathName": file.path_name })
}

/// Payload of `software_upgrade`
pub fn upgrade_payload(file_id: &str) -> Value {
    json!({ "fileId": file_id })
}

/// Payload of `turn_control`
///
/// Rejects angles that are not finite or exceed the axis limit.
pub fn turn_payload(turn: &TurnCommand) -> Result<Value, ControlError> {
    let limit = turn.axis.angle_limit();
    if !turn.angle.is_finite() || turn.angle.abs() > limit {
        return Err(ControlError::InvalidCommand(format!(
            "turn angle {} outside +/-{} degrees for {:?}",
            turn.angle, limit, turn.axis
        )));
    }
    Ok(json!({
        "mode": turn.mode,
        "axis": turn.axis.code(),
        "direct": turn.direction.code(),
        "angle": turn.angle,
    }))
}

/// Payload of `set_work_mode`
pub fn work_mode_payload(pattern: &str) -> Value {
    json!({ "pattern": pattern })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_names_round_trip() {
        for module in ControlModule::all() {
            assert_eq!(module.as_str().parse::<ControlModule>().unwrap(), *module);
        }
        assert!("format_disk".parse::<ControlModule>().is_err());
    }

    #[test]
    fn test_rtc_from_datetime() {
        let setting = RtcSetting::from_datetime("2024-05-01T08:30").unwrap();
        assert_eq!(setting.date, "2024-05-01");
        assert_eq!(setting.time, "08:30");
        assert!(RtcSetting::from_datetime("2024-05-01").is_none());
    }

    #[test]
    fn test_reset_payload() {
        assert_eq!(reset_payload(ResetKind::Soft), json!({ "rst_type": 1 }));
        assert_eq!(reset_payload(ResetKind::Task), json!({ "rst_type": 0 }));
    }

    #[test]
    fn test_file_management_payloads() {
        let file = StoredFile {
            file_id: "file-1700000000000-42-acu.bin".to_string(),
            path_name: "/mnt/update/acu.bin".to_string(),
        };
        assert_eq!(
            delete_file_payload(&file),
            json!({
                "fileId": "file-1700000000000-42-acu.bin",
                "pathName": "/mnt/update/acu.bin"
            })
        );
        assert_eq!(
            upgrade_payload("file-1700000000000-42-acu.bin"),
            json!({ "fileId": "file-1700000000000-42-acu.bin" })
        );
    }

    #[test]
    fn test_turn_payload_shape() {
        let turn = TurnCommand {
            mode: 1,
            axis: TurnAxis::Elevation,
            direction: TurnDirection::Negative,
            angle: 12.5,
        };
        assert_eq!(
            turn_payload(&turn).unwrap(),
            json!({ "mode": 1, "axis": 1, "direct": 1, "angle": 12.5 })
        );
    }

    #[test]
    fn test_turn_angle_is_limited_per_axis() {
        let mut turn = TurnCommand {
            mode: 0,
            axis: TurnAxis::Elevation,
            direction: TurnDirection::Positive,
            angle: 91.0,
        };
        assert!(matches!(
            turn_payload(&turn),
            Err(ControlError::InvalidCommand(_))
        ));

        turn.axis = TurnAxis::Azimuth;
        assert!(turn_payload(&turn).is_ok());

        turn.angle = f64::NAN;
        assert!(turn_payload(&turn).is_err());
    }

    #[test]
    fn test_work_mode_payload() {
        assert_eq!(work_mode_payload("2"), json!({ "pattern": "2" }));
        assert_eq!(
            "set_work_mode".parse::<ControlModule>().unwrap(),
            ControlModule::SetWorkMode
        );
    }
}
