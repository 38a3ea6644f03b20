//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::DelayWindow;
use crate::io::sensor::{
    CommandTable, DEFAULT_RESET_LEFT_HEX, DEFAULT_RESET_RIGHT_HEX, DEFAULT_START_HEX,
    DEFAULT_STOP_HEX, DEFAULT_SWING_LEFT_HEX, DEFAULT_SWING_RIGHT_HEX,
};
use anyhow::{bail, Context};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Device name used for the entry sensor in status maps and logs
pub const TRIGGER_DEVICE: &str = "trigger";
/// Device name used for the PLC link
pub const PLC_DEVICE: &str = "plc";

const DEFAULT_SWING_DELAY_MS: u64 = 50;
const DEFAULT_RESET_DELAY_MS: u64 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineMode {
    /// Entry sensor + per-lane sensors and pendulum actuators
    Pendulum,
    /// Single PLC speaking the 8-byte binary protocol
    Plc,
}

impl LineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineMode::Pendulum => "pendulum",
            LineMode::Plc => "plc",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteSection {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "sorter".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineSection {
    #[serde(default = "default_line_mode")]
    pub mode: LineMode,
    #[serde(default = "default_chutes_per_lane")]
    pub chutes_per_lane: u16,
}

impl Default for LineSection {
    fn default() -> Self {
        Self { mode: default_line_mode(), chutes_per_lane: default_chutes_per_lane() }
    }
}

fn default_line_mode() -> LineMode {
    LineMode::Pendulum
}

fn default_chutes_per_lane() -> u16 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSection {
    #[serde(default)]
    pub addr: String,
    pub lower_ms: u64,
    pub upper_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaneSection {
    pub name: String,
    pub addr: String,
    pub lower_ms: u64,
    pub upper_ms: u64,
    #[serde(default = "default_swing_delay_ms")]
    pub swing_delay_ms: u64,
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
}

fn default_swing_delay_ms() -> u64 {
    DEFAULT_SWING_DELAY_MS
}

fn default_reset_delay_ms() -> u64 {
    DEFAULT_RESET_DELAY_MS
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    /// Grace period past a window's upper bound before pulses/packages expire
    #[serde(default = "default_slack_ms")]
    pub slack_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Capacity of the device event channel feeding the dispatcher
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            slack_ms: default_slack_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_slack_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// Actuator frames as hex strings ("A5 01 01 5A" or "A501015A")
#[derive(Debug, Clone, Deserialize)]
pub struct CommandsSection {
    #[serde(default = "default_start_hex")]
    pub start: String,
    #[serde(default = "default_stop_hex")]
    pub stop: String,
    #[serde(default = "default_swing_left_hex")]
    pub swing_left: String,
    #[serde(default = "default_reset_left_hex")]
    pub reset_left: String,
    #[serde(default = "default_swing_right_hex")]
    pub swing_right: String,
    #[serde(default = "default_reset_right_hex")]
    pub reset_right: String,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            start: default_start_hex(),
            stop: default_stop_hex(),
            swing_left: default_swing_left_hex(),
            reset_left: default_reset_left_hex(),
            swing_right: default_swing_right_hex(),
            reset_right: default_reset_right_hex(),
        }
    }
}

fn default_start_hex() -> String {
    DEFAULT_START_HEX.to_string()
}

fn default_stop_hex() -> String {
    DEFAULT_STOP_HEX.to_string()
}

fn default_swing_left_hex() -> String {
    DEFAULT_SWING_LEFT_HEX.to_string()
}

fn default_reset_left_hex() -> String {
    DEFAULT_RESET_LEFT_HEX.to_string()
}

fn default_swing_right_hex() -> String {
    DEFAULT_SWING_RIGHT_HEX.to_string()
}

fn default_reset_right_hex() -> String {
    DEFAULT_RESET_RIGHT_HEX.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlcSection {
    #[serde(default)]
    pub addr: String,
    /// How long a sort command may wait for its feedback frame
    #[serde(default = "default_plc_feedback_timeout")]
    pub feedback_timeout_ms: u64,
}

impl Default for PlcSection {
    fn default() -> Self {
        Self { addr: String::new(), feedback_timeout_ms: default_plc_feedback_timeout() }
    }
}

fn default_plc_feedback_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSection {
    #[serde(default = "default_ingest_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ingest_port")]
    pub port: u16,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self { enabled: default_ingest_enabled(), port: default_ingest_port() }
    }
}

fn default_ingest_enabled() -> bool {
    true
}

fn default_ingest_port() -> u16 {
    25900
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9100
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub line: LineSection,
    pub trigger: TriggerSection,
    #[serde(default)]
    pub lanes: Vec<LaneSection>,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub plc: PlcSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// Static configuration of one sorting lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneConfig {
    pub name: String,
    pub addr: String,
    /// Trigger-to-lane-sensor travel window
    pub window: DelayWindow,
    /// Wait after the lane pulse before swinging
    pub swing_delay: Duration,
    /// Wait after the swing before resetting
    pub reset_delay: Duration,
}

impl LaneConfig {
    pub fn new(name: &str, addr: &str, lower_ms: u64, upper_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
            window: DelayWindow::from_millis(lower_ms, upper_ms),
            swing_delay: Duration::from_millis(DEFAULT_SWING_DELAY_MS),
            reset_delay: Duration::from_millis(DEFAULT_RESET_DELAY_MS),
        }
    }

    pub fn with_delays(mut self, swing_ms: u64, reset_ms: u64) -> Self {
        self.swing_delay = Duration::from_millis(swing_ms);
        self.reset_delay = Duration::from_millis(reset_ms);
        self
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mode: LineMode,
    chutes_per_lane: u16,
    trigger_addr: String,
    trigger_window: DelayWindow,
    lanes: Vec<LaneConfig>,
    slack: Duration,
    connect_timeout: Duration,
    write_timeout: Duration,
    reconnect_delay: Duration,
    event_channel_capacity: usize,
    commands: CommandTable,
    plc_addr: String,
    plc_feedback_timeout: Duration,
    ingest_enabled: bool,
    ingest_port: u16,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: "sorter".to_string(),
            mode: LineMode::Pendulum,
            chutes_per_lane: 2,
            trigger_addr: "127.0.0.1:4001".to_string(),
            trigger_window: DelayWindow::from_millis(200, 1500),
            lanes: vec![
                LaneConfig::new("lane-1", "127.0.0.1:4011", 1500, 4000),
                LaneConfig::new("lane-2", "127.0.0.1:4012", 2500, 5000),
            ],
            slack: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(3000),
            write_timeout: Duration::from_millis(1000),
            reconnect_delay: Duration::from_millis(2000),
            event_channel_capacity: 1024,
            commands: CommandTable::default(),
            plc_addr: "127.0.0.1:4020".to_string(),
            plc_feedback_timeout: Duration::from_millis(5000),
            ingest_enabled: true,
            ingest_port: 25900,
            metrics_interval_secs: 10,
            prometheus_port: 9100,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, &path.display().to_string())
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("Invalid TOML")?;

        let commands = &toml_config.commands;
        let commands = CommandTable::from_hex([
            &commands.start,
            &commands.stop,
            &commands.swing_left,
            &commands.reset_left,
            &commands.swing_right,
            &commands.reset_right,
        ])
        .context("Invalid [commands] section")?;

        let lanes = toml_config
            .lanes
            .into_iter()
            .map(|lane| LaneConfig {
                name: lane.name,
                addr: lane.addr,
                window: DelayWindow::from_millis(lane.lower_ms, lane.upper_ms),
                swing_delay: Duration::from_millis(lane.swing_delay_ms),
                reset_delay: Duration::from_millis(lane.reset_delay_ms),
            })
            .collect();

        let config = Self {
            site_id: toml_config.site.id,
            mode: toml_config.line.mode,
            chutes_per_lane: toml_config.line.chutes_per_lane,
            trigger_addr: toml_config.trigger.addr,
            trigger_window: DelayWindow::from_millis(
                toml_config.trigger.lower_ms,
                toml_config.trigger.upper_ms,
            ),
            lanes,
            slack: Duration::from_millis(toml_config.timing.slack_ms),
            connect_timeout: Duration::from_millis(toml_config.timing.connect_timeout_ms),
            write_timeout: Duration::from_millis(toml_config.timing.write_timeout_ms),
            reconnect_delay: Duration::from_millis(toml_config.timing.reconnect_delay_ms),
            event_channel_capacity: toml_config.timing.event_channel_capacity,
            commands,
            plc_addr: toml_config.plc.addr,
            plc_feedback_timeout: Duration::from_millis(toml_config.plc.feedback_timeout_ms),
            ingest_enabled: toml_config.ingest.enabled,
            ingest_port: toml_config.ingest.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: source.to_string(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Reject configurations the line cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        check_window("trigger", &self.trigger_window)?;

        if self.chutes_per_lane == 0 {
            bail!("line.chutes_per_lane must be at least 1");
        }
        if self.event_channel_capacity == 0 {
            bail!("timing.event_channel_capacity must be at least 1");
        }

        match self.mode {
            LineMode::Pendulum => {
                if self.trigger_addr.is_empty() {
                    bail!("trigger.addr is required in pendulum mode");
                }
                if self.lanes.is_empty() {
                    bail!("at least one [[lanes]] entry is required in pendulum mode");
                }
            }
            LineMode::Plc => {
                if self.plc_addr.is_empty() {
                    bail!("plc.addr is required in plc mode");
                }
            }
        }

        let mut names = FxHashSet::default();
        names.insert(TRIGGER_DEVICE);
        names.insert(PLC_DEVICE);
        for lane in &self.lanes {
            if lane.addr.is_empty() {
                bail!("lane '{}' has no addr", lane.name);
            }
            check_window(&lane.name, &lane.window)?;
            if !names.insert(lane.name.as_str()) {
                bail!("duplicate or reserved device name '{}'", lane.name);
            }
        }

        Ok(())
    }

    /// Lane serving a chute, if configured
    pub fn lane_for_chute(&self, chute: crate::domain::types::Chute) -> Option<usize> {
        chute.lane_index(self.chutes_per_lane).filter(|&idx| idx < self.lanes.len())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mode(&self) -> LineMode {
        self.mode
    }

    pub fn chutes_per_lane(&self) -> u16 {
        self.chutes_per_lane
    }

    pub fn trigger_addr(&self) -> &str {
        &self.trigger_addr
    }

    pub fn trigger_window(&self) -> DelayWindow {
        self.trigger_window
    }

    pub fn lanes(&self) -> &[LaneConfig] {
        &self.lanes
    }

    pub fn slack(&self) -> Duration {
        self.slack
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn event_channel_capacity(&self) -> usize {
        self.event_channel_capacity
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn plc_addr(&self) -> &str {
        &self.plc_addr
    }

    pub fn plc_feedback_timeout(&self) -> Duration {
        self.plc_feedback_timeout
    }

    pub fn ingest_enabled(&self) -> bool {
        self.ingest_enabled
    }

    pub fn ingest_port(&self) -> u16 {
        self.ingest_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to replace the lane table
    #[cfg(test)]
    pub fn with_lanes(mut self, lanes: Vec<LaneConfig>) -> Self {
        self.lanes = lanes;
        self
    }

    /// Builder method for tests to set the entry sensor window
    #[cfg(test)]
    pub fn with_trigger_window(mut self, lower_ms: u64, upper_ms: u64) -> Self {
        self.trigger_window = DelayWindow::from_millis(lower_ms, upper_ms);
        self
    }

    /// Builder method for tests to switch line mode
    #[cfg(test)]
    pub fn with_mode(mut self, mode: LineMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method for tests to shorten the reconnect delay
    #[cfg(test)]
    pub fn with_reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.reconnect_delay = Duration::from_millis(ms);
        self
    }
}

fn check_window(name: &str, window: &DelayWindow) -> anyhow::Result<()> {
    if window.lower > window.upper {
        bail!(
            "{name}: window lower bound {} ms exceeds upper bound {} ms",
            window.lower.as_millis(),
            window.upper.as_millis()
        );
    }
    Ok(())
}
