//! Thorlabs Elliptec ELL14 Rotation Mount Link
//!
//! Protocol: RS-485 multidrop bus, 9600 baud, ASCII encoded
//! Reference: ELLx modules protocol manual Issue 10
//!
//! Commands are `<addr><cmd>[data]` with no terminator; replies are
//! `<addr><HEADER>[data]\r\n`. Positions and offsets travel as 32-bit two's
//! complement pulse counts in 8 hex digits (143360 pulses per revolution).
//!
//! # Usage
//!
//! ```rust,ignore
//! use stage_driver_thorlabs::{Ell14Config, Ell14LinkFactory};
//! use stage_core::LinkFactory;
//!
//! let factory = Ell14LinkFactory::new(Ell14Config::default());
//! let link = factory.connect("/dev/ttyUSB0", 2).await?;
//! link.move_absolute(45.0).await?;
//! ```

use crate::shared_ports::{drain_serial_buffer, get_or_open_port, release_port, SharedPort};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use stage_core::error::{DriverError, DriverErrorKind};
use stage_core::link::{normalize_degrees, ActuatorLink, LinkFactory, MAX_VELOCITY};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

const DRIVER_TYPE: &str = "ell14";

// =============================================================================
// Ell14LinkFactory - LinkFactory implementation
// =============================================================================

/// Configuration for ELL14 links
#[derive(Debug, Clone, Deserialize)]
pub struct Ell14Config {
    /// Reply timeout for queries and settings, in milliseconds (default: 500)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Timeout for a motion command to complete, in milliseconds (default: 10000)
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,
    /// Optional custom calibration (pulses per degree); queried from the device when absent
    #[serde(default)]
    pub pulses_per_degree: Option<f64>,
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_move_timeout_ms() -> u64 {
    10_000
}

impl Default for Ell14Config {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            move_timeout_ms: default_move_timeout_ms(),
            pulses_per_degree: None,
        }
    }
}

impl Ell14Config {
    fn timeouts(&self) -> Ell14Timeouts {
        Ell14Timeouts {
            reply: Duration::from_millis(self.timeout_ms),
            motion: Duration::from_millis(self.move_timeout_ms),
        }
    }
}

/// Factory for ELL14 links.
pub struct Ell14LinkFactory {
    config: Ell14Config,
}

impl Ell14LinkFactory {
    /// Create a factory with the given link configuration.
    pub fn new(config: Ell14Config) -> Self {
        Self { config }
    }
}

impl LinkFactory for Ell14LinkFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Thorlabs ELL14 Rotation Mount"
    }

    fn connect(&self, port: &str, address: u8) -> BoxFuture<'static, Result<Arc<dyn ActuatorLink>>> {
        let config = self.config.clone();
        let port_path = port.to_string();
        Box::pin(async move {
            let prefix = address_prefix(address)?;
            let shared = get_or_open_port(&port_path, Duration::from_millis(config.timeout_ms)).await?;

            let link = match config.pulses_per_degree {
                Some(ppd) => Ell14Link::with_calibration(shared, prefix, ppd, config.timeouts()),
                None => Ell14Link::calibrated(shared, prefix, config.timeouts()).await?,
            }
            .with_port_path(&port_path);

            tracing::info!(port = %port_path, address = %prefix, "Connected to ELL14");
            Ok(Arc::new(link) as Arc<dyn ActuatorLink>)
        })
    }
}

/// Render a bus address (0-15) as the single hex digit the protocol uses.
pub fn address_prefix(address: u8) -> Result<char> {
    char::from_digit(u32::from(address), 16)
        .map(|c| c.to_ascii_uppercase())
        .ok_or_else(|| {
            DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Configuration,
                format!("Bus address {} out of range 0-15", address),
            )
            .into()
        })
}

// =============================================================================
// ELL14 Status Codes
// =============================================================================

/// ELL14 status/error codes returned in GS responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ell14StatusCode {
    Ok = 0x00,
    CommunicationTimeout = 0x01,
    MechanicalTimeout = 0x02,
    CommandError = 0x03,
    ValueOutOfRange = 0x04,
    ModuleIsolated = 0x05,
    ModuleOutOfIsolation = 0x06,
    InitializationError = 0x07,
    ThermalError = 0x08,
    Busy = 0x09,
    SensorError = 0x0A,
    MotorError = 0x0B,
    OutOfRange = 0x0C,
    OverCurrentError = 0x0D,
    Unknown = 0xFF,
}

impl Ell14StatusCode {
    pub fn from_hex(hex: &str) -> Self {
        match u8::from_str_radix(hex, 16) {
            Ok(code) => Self::from_u8(code),
            Err(_) => Self::Unknown,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => Self::Ok,
            0x01 => Self::CommunicationTimeout,
            0x02 => Self::MechanicalTimeout,
            0x03 => Self::CommandError,
            0x04 => Self::ValueOutOfRange,
            0x05 => Self::ModuleIsolated,
            0x06 => Self::ModuleOutOfIsolation,
            0x07 => Self::InitializationError,
            0x08 => Self::ThermalError,
            0x09 => Self::Busy,
            0x0A => Self::SensorError,
            0x0B => Self::MotorError,
            0x0C => Self::OutOfRange,
            0x0D => Self::OverCurrentError,
            _ => Self::Unknown,
        }
    }

    /// Whether the code reports a completed command.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok | Self::ModuleOutOfIsolation)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "No error",
            Self::CommunicationTimeout => "Communication timeout",
            Self::MechanicalTimeout => "Mechanical timeout",
            Self::CommandError => "Command error",
            Self::ValueOutOfRange => "Value out of range",
            Self::ModuleIsolated => "Module isolated",
            Self::ModuleOutOfIsolation => "Module out of isolation",
            Self::InitializationError => "Initialization error",
            Self::ThermalError => "Thermal error",
            Self::Busy => "Busy",
            Self::SensorError => "Sensor error",
            Self::MotorError => "Motor error",
            Self::OutOfRange => "Position out of range",
            Self::OverCurrentError => "Over current error",
            Self::Unknown => "Unknown error",
        }
    }

    fn into_error(self, command: &str) -> anyhow::Error {
        let kind = match self {
            Self::CommunicationTimeout | Self::MechanicalTimeout => DriverErrorKind::Timeout,
            Self::CommandError | Self::ValueOutOfRange | Self::OutOfRange => {
                DriverErrorKind::InvalidParameter
            }
            Self::ModuleIsolated => DriverErrorKind::Communication,
            _ => DriverErrorKind::Hardware,
        };
        DriverError::new(
            DRIVER_TYPE,
            kind,
            format!("'{}' rejected: {} (GS{:02X})", command, self.description(), self as u8),
        )
        .into()
    }
}

// =============================================================================
// Replies
// =============================================================================

/// A parsed ELL14 reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ell14Reply {
    /// `GS` status reply
    Status(Ell14StatusCode),
    /// `PO` position reply, in pulses
    Position(i32),
    /// `GV` velocity reply
    Velocity(u8),
    /// `HO` home offset reply, in pulses
    HomeOffset(i32),
    /// `IN` device information payload
    Info(String),
    /// Any other header
    Other { header: String, payload: String },
}

impl Ell14Reply {
    /// Parse a reply line addressed to `prefix`.
    pub fn parse(prefix: char, line: &str) -> Result<Self> {
        let line = line.trim();
        let body = line
            .strip_prefix(prefix)
            .ok_or_else(|| anyhow!("Reply '{}' is not addressed to {}", line, prefix))?;
        let header = body
            .get(..2)
            .ok_or_else(|| anyhow!("Reply '{}' has no header", line))?
            .to_ascii_uppercase();
        let payload = body.get(2..).unwrap_or_default();

        let reply = match header.as_str() {
            "GS" => Self::Status(Ell14StatusCode::from_hex(payload.get(..2).unwrap_or(payload))),
            "PO" => Self::Position(parse_pulses(payload, line)?),
            "HO" => Self::HomeOffset(parse_pulses(payload, line)?),
            "GV" => Self::Velocity(
                u8::from_str_radix(payload.get(..2).unwrap_or(payload), 16)
                    .map_err(|_| anyhow!("Malformed velocity reply '{}'", line))?,
            ),
            "IN" => Self::Info(payload.to_string()),
            _ => Self::Other {
                header,
                payload: payload.to_string(),
            },
        };
        Ok(reply)
    }
}

fn parse_pulses(payload: &str, line: &str) -> Result<i32> {
    let hex = payload
        .get(..8)
        .ok_or_else(|| anyhow!("Truncated pulse count in reply '{}'", line))?;
    let raw = u32::from_str_radix(hex, 16)
        .map_err(|_| anyhow!("Malformed pulse count in reply '{}'", line))?;
    Ok(raw as i32)
}

/// Find the first complete line in `buffer`, optionally one addressed to `prefix`.
fn complete_line(buffer: &[u8], prefix: Option<char>) -> Option<String> {
    let text = String::from_utf8_lossy(buffer);
    let last_terminator = text.rfind(['\r', '\n'])?;
    text[..last_terminator]
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| prefix.map_or(true, |p| line.starts_with(p)))
        .map(str::to_string)
}

// =============================================================================
// Ell14Link
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Ell14Timeouts {
    reply: Duration,
    motion: Duration,
}

impl Default for Ell14Timeouts {
    fn default() -> Self {
        Ell14Config::default().timeouts()
    }
}

/// Link to one ELL14 axis.
///
/// Multiple links can share a single serial port via the shared_ports module.
pub struct Ell14Link {
    port: SharedPort,
    port_path: Option<String>,
    prefix: char,
    pulses_per_degree: f64,
    timeouts: Ell14Timeouts,
}

impl Ell14Link {
    /// Default calibration: 143360 pulses / 360 degrees = 398.2222 pulses/degree
    pub const DEFAULT_PULSES_PER_DEGREE: f64 = 143_360.0 / 360.0;

    /// Create a link with default calibration and timeouts.
    pub fn with_shared_port(port: SharedPort, address: u8) -> Result<Self> {
        Ok(Self::with_calibration(
            port,
            address_prefix(address)?,
            Self::DEFAULT_PULSES_PER_DEGREE,
            Ell14Timeouts::default(),
        ))
    }

    fn with_calibration(
        port: SharedPort,
        prefix: char,
        pulses_per_degree: f64,
        timeouts: Ell14Timeouts,
    ) -> Self {
        Self {
            port,
            port_path: None,
            prefix,
            pulses_per_degree,
            timeouts,
        }
    }

    /// Create a link with calibration queried from the device (`in` command).
    async fn calibrated(port: SharedPort, prefix: char, timeouts: Ell14Timeouts) -> Result<Self> {
        let mut link = Self::with_calibration(port, prefix, Self::DEFAULT_PULSES_PER_DEGREE, timeouts);

        match link.transaction("in", timeouts.reply).await {
            Ok(Ell14Reply::Info(payload)) => {
                link.pulses_per_degree = calibration_from_info(prefix, &payload);
            }
            Ok(other) => {
                tracing::warn!(address = %prefix, reply = ?other, "Unexpected IN reply, using default calibration");
            }
            Err(e) => {
                tracing::warn!(address = %prefix, error = %e, "Device info query failed, using default calibration");
            }
        }

        tracing::info!(
            address = %prefix,
            pulses_per_degree = link.pulses_per_degree,
            "Calibrated ELL14 link"
        );
        Ok(link)
    }

    fn with_port_path(mut self, port_path: &str) -> Self {
        self.port_path = Some(port_path.to_string());
        self
    }

    /// Get the bus address prefix.
    pub fn address(&self) -> char {
        self.prefix
    }

    /// Get the calibration value.
    pub fn pulses_per_degree(&self) -> f64 {
        self.pulses_per_degree
    }

    /// Rejects distances that do not fit the 32-bit pulse field.
    fn degrees_to_pulses(&self, degrees: f64) -> Result<i32> {
        let pulses = (degrees * self.pulses_per_degree).round();
        if !pulses.is_finite() || pulses < f64::from(i32::MIN) || pulses > f64::from(i32::MAX) {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::InvalidParameter,
                format!("{} degrees is outside the device's pulse range", degrees),
            )
            .into());
        }
        Ok(pulses as i32)
    }

    fn pulses_to_degrees(&self, pulses: i32) -> f64 {
        normalize_degrees(f64::from(pulses) / self.pulses_per_degree).unwrap_or(0.0)
    }

    /// Write `command` verbatim and collect one complete reply line.
    ///
    /// On the multidrop bus other devices may have left data behind, so the
    /// receive buffer is drained first. With `prefix` set, lines addressed to
    /// other devices are skipped.
    async fn exchange(&self, command: &str, prefix: Option<char>, wait: Duration) -> Result<String> {
        let mut guard = self.port.lock().await;

        let discarded = drain_serial_buffer(&mut *guard, Duration::from_millis(10)).await;
        if discarded > 0 {
            tracing::trace!(discarded, "Cleared pending data before ELL14 command");
        }

        guard.write_all(command.as_bytes()).await?;
        guard.flush().await?;

        let mut response = Vec::with_capacity(64);
        let mut buf = [0u8; 64];
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(line) = complete_line(&response, prefix) {
                tracing::debug!(cmd = %command, response = %line, "ELL14 transaction");
                return Ok(line);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, guard.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        Err(DriverError::new(
            DRIVER_TYPE,
            DriverErrorKind::Timeout,
            format!(
                "No reply to '{}' (received '{}')",
                command,
                String::from_utf8_lossy(&response).trim()
            ),
        )
        .into())
    }

    /// Send an addressed command and parse the reply.
    #[instrument(skip(self), fields(address = %self.prefix))]
    async fn transaction(&self, cmd: &str, wait: Duration) -> Result<Ell14Reply> {
        let full_cmd = format!("{}{}", self.prefix, cmd);
        let line = self.exchange(&full_cmd, Some(self.prefix), wait).await?;
        Ell14Reply::parse(self.prefix, &line)
    }

    /// Send a setting command and require a `GS00` acknowledgement.
    async fn acknowledged(&self, cmd: &str) -> Result<()> {
        match self.transaction(cmd, self.timeouts.reply).await? {
            Ell14Reply::Status(code) if code.is_ok() => Ok(()),
            Ell14Reply::Status(code) => Err(code.into_error(cmd)),
            other => Err(anyhow!("Unexpected reply to '{}': {:?}", cmd, other)),
        }
    }

    /// Send a motion command and wait for it to finish.
    ///
    /// The device answers a completed move with `PO`. A `GS09` means the move
    /// is still running, so the status is polled until it settles.
    async fn motion(&self, cmd: &str) -> Result<()> {
        match self.transaction(cmd, self.timeouts.motion).await? {
            Ell14Reply::Position(_) => Ok(()),
            Ell14Reply::Status(code) if code.is_ok() => Ok(()),
            Ell14Reply::Status(Ell14StatusCode::Busy) => self.wait_settled().await,
            Ell14Reply::Status(code) => Err(code.into_error(cmd)),
            other => Err(anyhow!("Unexpected reply to '{}': {:?}", cmd, other)),
        }
    }

    /// Get device status.
    pub async fn get_status(&self) -> Result<Ell14StatusCode> {
        match self.transaction("gs", self.timeouts.reply).await? {
            Ell14Reply::Status(code) => Ok(code),
            other => {
                tracing::debug!(address = %self.prefix, reply = ?other, "ELL14 get_status got non-GS reply");
                Ok(Ell14StatusCode::Unknown)
            }
        }
    }

    #[instrument(skip(self), fields(address = %self.prefix))]
    async fn wait_settled(&self) -> Result<()> {
        let start = tokio::time::Instant::now();
        let mut consecutive_settled = 0;

        loop {
            if start.elapsed() > self.timeouts.motion {
                tracing::warn!(address = %self.prefix, consecutive_settled, "ELL14 wait_settled timed out");
                return Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::Timeout,
                    format!("Motion did not settle within {:?}", self.timeouts.motion),
                )
                .into());
            }

            match self.get_status().await {
                Ok(status) if status.is_ok() => {
                    consecutive_settled += 1;
                    if consecutive_settled >= 3 {
                        return Ok(());
                    }
                }
                Ok(Ell14StatusCode::Busy) => consecutive_settled = 0,
                Ok(status) => return Err(status.into_error("gs")),
                Err(e) => {
                    // Device may not respond during motion
                    tracing::debug!(address = %self.prefix, error = %e, "ELL14 get_status error while settling");
                    consecutive_settled = 0;
                }
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Extract pulses per degree from an `IN` payload.
///
/// Format: `{type:2}{serial:8}{year:4}{fw:2}{hw:2}{travel:4}{pulses_per_unit:8}`.
/// For the ELL14 the trailing field is pulses per revolution (0x00023000).
fn calibration_from_info(prefix: char, payload: &str) -> f64 {
    let trimmed = payload.trim();
    let parsed = trimmed
        .get(trimmed.len().saturating_sub(8)..)
        .filter(|_| trimmed.len() >= 30)
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .map(|ppu| f64::from(ppu) / 360.0);

    match parsed {
        // Sanity check: pulses_per_degree should be ~398 for ELL14
        Some(ppd) if ppd > 100.0 && ppd < 1000.0 => ppd,
        _ => {
            tracing::warn!(
                address = %prefix,
                payload = %trimmed,
                "Invalid calibration in IN reply, using default"
            );
            Ell14Link::DEFAULT_PULSES_PER_DEGREE
        }
    }
}

#[async_trait]
impl ActuatorLink for Ell14Link {
    #[instrument(skip(self), fields(address = %self.prefix))]
    async fn move_absolute(&self, degrees: f64) -> Result<()> {
        let target = normalize_degrees(degrees).ok_or_else(|| anyhow!("Invalid target {}", degrees))?;
        let pulses = self.degrees_to_pulses(target)?;
        self.motion(&format!("ma{:08X}", pulses as u32)).await
    }

    #[instrument(skip(self), fields(address = %self.prefix))]
    async fn move_relative(&self, degrees: f64) -> Result<()> {
        if !degrees.is_finite() {
            return Err(anyhow!("Invalid distance {}", degrees));
        }
        let pulses = self.degrees_to_pulses(degrees)?;
        self.motion(&format!("mr{:08X}", pulses as u32)).await
    }

    #[instrument(skip(self), fields(address = %self.prefix))]
    async fn home(&self) -> Result<()> {
        // Direction byte 0: clockwise
        self.motion("ho0").await
    }

    async fn get_position(&self) -> Result<f64> {
        match self.transaction("gp", self.timeouts.reply).await? {
            Ell14Reply::Position(pulses) => Ok(self.pulses_to_degrees(pulses)),
            Ell14Reply::Status(code) => Err(code.into_error("gp")),
            other => Err(anyhow!("Failed to parse position response: {:?}", other)),
        }
    }

    async fn get_velocity(&self) -> Result<f64> {
        match self.transaction("gv", self.timeouts.reply).await? {
            Ell14Reply::Velocity(v) => Ok(f64::from(v)),
            Ell14Reply::Status(code) => Err(code.into_error("gv")),
            other => Err(anyhow!("Failed to parse velocity response: {:?}", other)),
        }
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if !velocity.is_finite() {
            return Err(anyhow!("Invalid velocity {}", velocity));
        }
        let value = velocity.round().clamp(0.0, MAX_VELOCITY) as u8;
        self.acknowledged(&format!("sv{:02X}", value)).await
    }

    async fn get_home_offset(&self) -> Result<f64> {
        match self.transaction("go", self.timeouts.reply).await? {
            Ell14Reply::HomeOffset(pulses) => Ok(self.pulses_to_degrees(pulses)),
            Ell14Reply::Status(code) => Err(code.into_error("go")),
            other => Err(anyhow!("Failed to parse home offset response: {:?}", other)),
        }
    }

    async fn set_home_offset(&self, degrees: f64) -> Result<()> {
        let offset = normalize_degrees(degrees).ok_or_else(|| anyhow!("Invalid offset {}", degrees))?;
        let pulses = self.degrees_to_pulses(offset)?;
        self.acknowledged(&format!("so{:08X}", pulses as u32)).await
    }

    async fn is_moving(&self) -> Result<bool> {
        match self.get_status().await? {
            Ell14StatusCode::Busy => Ok(true),
            code if code.is_ok() => Ok(false),
            code => Err(code.into_error("gs")),
        }
    }

    #[instrument(skip(self), fields(address = %self.prefix))]
    async fn raw_command(&self, command: &str) -> Result<String> {
        self.exchange(command, None, self.timeouts.reply).await
    }

    async fn close(&self) -> Result<()> {
        {
            let mut guard = self.port.lock().await;
            guard.flush().await?;
        }
        if let Some(path) = &self.port_path {
            release_port(path, &self.port);
        }
        tracing::info!(address = %self.prefix, port = ?self.port_path, "Closed ELL14 link");
        Ok(())
    }
}
