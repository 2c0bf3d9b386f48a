//! By-name attribute and command surface.
//!
//! An RPC or attribute server binds to a device through [`DeviceInterface`]:
//! a fixed table of attributes and commands addressed by name, with values
//! carried as `serde_json::Value`. [`StageController`] implements it on top of
//! its typed methods.

use crate::controller::StageController;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use stage_core::{StageError, StageResult};

/// Value type of an attribute or command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// 64-bit float
    Float,
    /// Unsigned integer
    UnsignedInt,
    /// Text
    String,
    /// Device state name
    State,
}

/// Attribute access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Read only
    Read,
    /// Read and write
    ReadWrite,
}

/// Static description of an attribute.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AttributeInfo {
    /// Attribute name
    pub name: &'static str,
    /// Value type
    pub kind: ValueKind,
    /// Access mode
    pub access: Access,
    /// Display unit
    pub unit: Option<&'static str>,
    /// One-line description
    pub description: &'static str,
}

/// Static description of a command.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CommandInfo {
    /// Command name
    pub name: &'static str,
    /// Argument type, if the command takes one
    pub argument: Option<ValueKind>,
    /// Result type, if the command returns one
    pub returns: Option<ValueKind>,
    /// One-line description
    pub description: &'static str,
}

/// Attributes exposed by a rotation stage.
pub const ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo {
        name: "position",
        kind: ValueKind::Float,
        access: Access::ReadWrite,
        unit: Some("deg"),
        description: "Angle in [0, 360); writing moves the stage",
    },
    AttributeInfo {
        name: "velocity",
        kind: ValueKind::Float,
        access: Access::ReadWrite,
        unit: None,
        description: "Velocity setting in [0, 64]; clamped on write",
    },
    AttributeInfo {
        name: "home_offset",
        kind: ValueKind::Float,
        access: Access::ReadWrite,
        unit: Some("deg"),
        description: "Offset of the home reference in [0, 360)",
    },
    AttributeInfo {
        name: "num_operations",
        kind: ValueKind::UnsignedInt,
        access: Access::Read,
        unit: None,
        description: "Motion commands since the last swipe",
    },
    AttributeInfo {
        name: "state",
        kind: ValueKind::State,
        access: Access::Read,
        unit: None,
        description: "INIT, ON, MOVING or FAULT",
    },
    AttributeInfo {
        name: "status",
        kind: ValueKind::String,
        access: Access::Read,
        unit: None,
        description: "Human-readable status with maintenance advisory",
    },
];

/// Commands exposed by a rotation stage.
pub const COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        name: "homing",
        argument: None,
        returns: None,
        description: "Run the home sequence",
    },
    CommandInfo {
        name: "swipe",
        argument: None,
        returns: None,
        description: "Sweep 0 -> 359 -> 0, restore the position and reset the operation count",
    },
    CommandInfo {
        name: "raw_command",
        argument: Some(ValueKind::String),
        returns: Some(ValueKind::String),
        description: "Send a raw protocol command (unsafe, diagnostics only)",
    },
    CommandInfo {
        name: "shift_offset",
        argument: Some(ValueKind::Float),
        returns: Some(ValueKind::Float),
        description: "Add degrees to the home offset",
    },
    CommandInfo {
        name: "move_relative",
        argument: Some(ValueKind::Float),
        returns: None,
        description: "Move by a signed number of degrees",
    },
    CommandInfo {
        name: "init",
        argument: None,
        returns: None,
        description: "Close and reopen the link",
    },
];

/// Look up an attribute description by name.
pub fn attribute_info(name: &str) -> Option<&'static AttributeInfo> {
    ATTRIBUTES.iter().find(|a| a.name == name)
}

/// Look up a command description by name.
pub fn command_info(name: &str) -> Option<&'static CommandInfo> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Fixed by-name surface an attribute server calls into.
///
/// # Contract
/// - Unknown names and values of the wrong type fail with
///   [`StageError::InvalidArgument`].
/// - Writes to read-only attributes fail with [`StageError::ReadOnly`].
/// - Commands without a result return `Value::Null`.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// Attribute table.
    fn attributes(&self) -> &'static [AttributeInfo] {
        ATTRIBUTES
    }

    /// Command table.
    fn commands(&self) -> &'static [CommandInfo] {
        COMMANDS
    }

    /// Read an attribute.
    async fn read_attribute(&self, name: &str) -> StageResult<Value>;

    /// Write an attribute.
    async fn write_attribute(&self, name: &str, value: Value) -> StageResult<()>;

    /// Run a command. `args` is `Value::Null` for commands without argument.
    async fn execute_command(&self, name: &str, args: Value) -> StageResult<Value>;
}

fn expect_float(name: &str, value: &Value) -> StageResult<f64> {
    value.as_f64().ok_or_else(|| {
        StageError::InvalidArgument(format!("'{}' expects a number, got {}", name, value))
    })
}

fn expect_string<'a>(name: &str, value: &'a Value) -> StageResult<&'a str> {
    value.as_str().ok_or_else(|| {
        StageError::InvalidArgument(format!("'{}' expects a string, got {}", name, value))
    })
}

#[async_trait]
impl DeviceInterface for StageController {
    async fn read_attribute(&self, name: &str) -> StageResult<Value> {
        match name {
            "position" => Ok(json!(self.read_position().await?)),
            "velocity" => Ok(json!(self.get_velocity().await?)),
            "home_offset" => Ok(json!(self.get_home_offset().await?)),
            "num_operations" => {
                self.refresh_status().await?;
                Ok(json!(self.num_operations()))
            }
            "state" => Ok(json!(self.refresh_status().await?.state)),
            "status" => Ok(json!(self.refresh_status().await?.status)),
            _ => Err(StageError::InvalidArgument(format!(
                "unknown attribute '{}'",
                name
            ))),
        }
    }

    async fn write_attribute(&self, name: &str, value: Value) -> StageResult<()> {
        let info = attribute_info(name)
            .ok_or_else(|| StageError::InvalidArgument(format!("unknown attribute '{}'", name)))?;
        if info.access == Access::Read {
            return Err(StageError::ReadOnly(name.to_string()));
        }

        let number = expect_float(name, &value)?;
        match name {
            "position" => self.write_position(number).await,
            "velocity" => self.set_velocity(number).await.map(|_| ()),
            "home_offset" => self.set_home_offset(number).await.map(|_| ()),
            _ => Err(StageError::ReadOnly(name.to_string())),
        }
    }

    async fn execute_command(&self, name: &str, args: Value) -> StageResult<Value> {
        match name {
            "homing" => self.home().await.map(|()| Value::Null),
            "swipe" => self.swipe().await.map(|()| Value::Null),
            "raw_command" => {
                let text = expect_string(name, &args)?;
                Ok(json!(self.raw_command(text).await?))
            }
            "shift_offset" => {
                let delta = expect_float(name, &args)?;
                Ok(json!(self.shift_home_offset(delta).await?))
            }
            "move_relative" => {
                let delta = expect_float(name, &args)?;
                self.move_relative(delta).await.map(|()| Value::Null)
            }
            "init" => self.reinitialize().await.map(|()| Value::Null),
            _ => Err(StageError::InvalidArgument(format!(
                "unknown command '{}'",
                name
            ))),
        }
    }
}
