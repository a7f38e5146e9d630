//! Tunnel configuration surface.
//!
//! Loaded from a TOML file, then normalized in three passes: base defaults,
//! profile overrides, and forward-map folding. Validation happens at load and
//! is fatal before the data plane starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fragment::FragmentConfig;
use crate::mimic::MimicConfig;
use crate::obfs::ObfsConfig;
use crate::TunnelError;

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

/// One client connection path: a server endpoint plus its pool parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Transport kind (`tcpmux`, `httpmux`, `wsmux`); empty inherits the
    /// top-level transport.
    pub transport: String,
    /// Server address, `host:port` or URL form.
    pub addr: String,
    /// Number of concurrent sessions to maintain on this path.
    pub connection_pool: usize,
    /// Seconds between reconnect attempts.
    pub retry_interval: u64,
    /// Dial timeout in seconds.
    pub dial_timeout: u64,
}

/// Multiplexer tuning. Must match between server and client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuxConfig {
    /// Keepalive ping interval in seconds.
    pub keepalive: u64,
    /// Session receive buffer bound in bytes.
    pub max_recv: usize,
    /// Per-stream receive buffer bound in bytes.
    pub max_stream: usize,
    /// Maximum mux frame size in bytes (the adaptive-framing base value).
    pub frame_size: usize,
    /// Protocol version; 2 is current.
    pub version: u8,
}

impl Default for SmuxConfig {
    fn default() -> Self {
        Self {
            keepalive: 10,
            max_recv: 4 * 1024 * 1024,
            max_stream: 4 * 1024 * 1024,
            frame_size: 32 * 1024,
            version: 2,
        }
    }
}

/// Kernel-level TCP tuning applied to dialed and accepted sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub tcp_nodelay: bool,
    /// TCP keepalive period in seconds.
    pub tcp_keepalive: u64,
    /// Kernel receive buffer in bytes; 0 leaves the OS default.
    pub tcp_read_buffer: usize,
    /// Kernel send buffer in bytes; 0 leaves the OS default.
    pub tcp_write_buffer: usize,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: 15,
            tcp_read_buffer: 0,
            tcp_write_buffer: 0,
        }
    }
}

/// Reverse forward mappings, `bind->target` per entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub tcp: Vec<String>,
    pub udp: Vec<String>,
}

/// Structured alternative to the `bind->target` string syntax.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardMap {
    /// `tcp`, `udp` or `both`.
    pub r#type: String,
    pub bind: String,
    pub target: String,
}

/// Main tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    /// Server listen address.
    pub listen: String,
    /// Default transport for paths that leave theirs empty.
    pub transport: String,
    /// Pre-shared key; SHA-256 of this string is the AES-256 key.
    pub psk: String,
    /// Tuning profile: `balanced`, `aggressive`, `stable`, `latency`.
    pub profile: String,
    pub verbose: bool,
    /// `""`/`none`, or `snappy`. Must match on both ends.
    pub compression: String,
    /// Permits an empty PSK (plaintext framing) for loopback testing only.
    pub allow_insecure: bool,
    /// Stats log interval in seconds; 0 disables.
    pub stats_interval: u64,

    /// Single-server shorthand; folded into `paths` when `paths` is empty.
    pub server_url: String,
    pub paths: Vec<PathConfig>,

    pub smux: SmuxConfig,
    pub advanced: AdvancedConfig,
    pub obfs: ObfsConfig,
    pub fragment: FragmentConfig,
    pub mimic: MimicConfig,

    pub forward: ForwardConfig,
    pub maps: Vec<ForwardMap>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            listen: String::new(),
            transport: "httpmux".to_string(),
            psk: String::new(),
            profile: "balanced".to_string(),
            verbose: false,
            compression: String::new(),
            allow_insecure: false,
            stats_interval: 60,
            server_url: String::new(),
            paths: Vec::new(),
            smux: SmuxConfig::default(),
            advanced: AdvancedConfig::default(),
            obfs: ObfsConfig::default(),
            fragment: FragmentConfig::default(),
            mimic: MimicConfig::default(),
            forward: ForwardConfig::default(),
            maps: Vec::new(),
        }
    }
}

impl Config {
    /// Loads, normalizes and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, TunnelError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Config(format!("read {}: {}", path.display(), e)))?;
        let mut config: Self = toml::from_str(&contents)
            .map_err(|e| TunnelError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Applies defaults, profile overrides and map folding.
    pub fn normalize(&mut self) {
        self.transport = self.transport.trim().to_lowercase();
        if self.transport.is_empty() {
            self.transport = "httpmux".to_string();
        }
        self.profile = self.profile.trim().to_lowercase();
        if self.profile.is_empty() {
            self.profile = "balanced".to_string();
        }
        self.listen = self.listen.trim().to_string();
        if self.mode == Mode::Server && self.listen.is_empty() {
            self.listen = "0.0.0.0:2020".to_string();
        }

        if self.paths.is_empty() && !self.server_url.trim().is_empty() {
            self.paths.push(PathConfig {
                transport: self.transport.clone(),
                addr: self.server_url.trim().to_string(),
                connection_pool: 2,
                retry_interval: 3,
                dial_timeout: 10,
            });
        }

        self.apply_smux_defaults();
        self.mimic.apply_defaults();
        self.apply_obfs_defaults();
        self.fragment.apply_defaults();
        self.apply_profile();
        self.fold_maps();

        for path in &mut self.paths {
            path.addr = path.addr.trim().to_string();
            path.transport = path.transport.trim().to_lowercase();
            if path.transport.is_empty() {
                path.transport = self.transport.clone();
            }
            if path.connection_pool == 0 {
                path.connection_pool = 2;
            }
            if path.retry_interval == 0 {
                path.retry_interval = 3;
            }
            if path.dial_timeout == 0 {
                path.dial_timeout = 10;
            }
        }
    }

    fn apply_smux_defaults(&mut self) {
        let d = SmuxConfig::default();
        if self.smux.keepalive == 0 {
            self.smux.keepalive = d.keepalive;
        }
        if self.smux.max_recv == 0 {
            self.smux.max_recv = d.max_recv;
        }
        if self.smux.max_stream == 0 {
            self.smux.max_stream = d.max_stream;
        }
        if self.smux.frame_size == 0 {
            self.smux.frame_size = d.frame_size;
        }
        if self.smux.version == 0 {
            self.smux.version = d.version;
        }
    }

    fn apply_obfs_defaults(&mut self) {
        if self.obfs.min_padding == 0 {
            self.obfs.min_padding = 4;
        }
        if self.obfs.max_padding == 0 {
            self.obfs.max_padding = 32;
        }
        // delay_ms stays at the user's value: 0 means no jitter, and jitter
        // on high-latency links destroys throughput.
    }

    /// Profile presets rewrite the pool/retry/obfs knobs wholesale.
    fn apply_profile(&mut self) {
        match self.profile.as_str() {
            "aggressive" => {
                self.fragment.enabled = false;
                self.obfs.enabled = false;
                self.obfs.min_delay_ms = 0;
                self.obfs.max_delay_ms = 0;
                if self.obfs.max_padding > 64 {
                    self.obfs.max_padding = 64;
                }
                if self.smux.keepalive > 5 {
                    self.smux.keepalive = 5;
                }
                if self.smux.frame_size < 32 * 1024 {
                    self.smux.frame_size = 32 * 1024;
                }
                for path in &mut self.paths {
                    if path.connection_pool < 4 {
                        path.connection_pool = 4;
                    }
                    if path.retry_interval == 0 || path.retry_interval > 2 {
                        path.retry_interval = 2;
                    }
                }
            }
            "stable" => {
                if self.smux.keepalive > 15 {
                    self.smux.keepalive = 15;
                }
                if self.smux.max_recv > 2 * 1024 * 1024 {
                    self.smux.max_recv = 2 * 1024 * 1024;
                }
                if self.smux.max_stream > 1024 * 1024 {
                    self.smux.max_stream = 1024 * 1024;
                }
                self.obfs.min_delay_ms = 0;
                self.obfs.max_delay_ms = 0;
            }
            "latency" => {
                if self.smux.keepalive > 5 {
                    self.smux.keepalive = 5;
                }
                self.obfs.min_delay_ms = 0;
                self.obfs.max_delay_ms = 0;
                for path in &mut self.paths {
                    if path.connection_pool == 0 {
                        path.connection_pool = 3;
                    }
                    if path.retry_interval == 0 || path.retry_interval > 2 {
                        path.retry_interval = 2;
                    }
                }
            }
            _ => {} // balanced and friends keep the base defaults
        }
    }

    /// Folds structured `maps` entries into `forward.tcp` / `forward.udp`
    /// when the string form is absent.
    fn fold_maps(&mut self) {
        if !self.forward.tcp.is_empty() || !self.forward.udp.is_empty() {
            return;
        }
        for map in &self.maps {
            let entry = format!("{}->{}", map.bind.trim(), map.target.trim());
            match map.r#type.trim().to_lowercase().as_str() {
                "udp" => self.forward.udp.push(entry),
                "both" => {
                    self.forward.tcp.push(entry.clone());
                    self.forward.udp.push(entry);
                }
                _ => self.forward.tcp.push(entry),
            }
        }
    }

    /// Checks for fatal misconfiguration.
    pub fn validate(&self) -> Result<(), TunnelError> {
        let err = |msg: String| Err(TunnelError::Config(msg));

        match self.transport.as_str() {
            "tcpmux" | "httpmux" | "wsmux" => {}
            other => {
                return err(format!(
                    "invalid transport {:?}: expected tcpmux/httpmux/wsmux",
                    other
                ))
            }
        }

        if self.psk.is_empty() && !self.allow_insecure {
            return err(
                "psk is empty: refusing to run an unencrypted tunnel \
                 (set allow_insecure = true for loopback testing only)"
                    .to_string(),
            );
        }

        match self.mode {
            Mode::Server => {
                if self.listen.is_empty() {
                    return err("server mode requires a 'listen' address".to_string());
                }
            }
            Mode::Client => {
                if self.paths.is_empty() {
                    return err("client mode requires 'server_url' or 'paths'".to_string());
                }
                for (i, path) in self.paths.iter().enumerate() {
                    if path.addr.is_empty() {
                        return err(format!("paths[{}].addr is empty", i));
                    }
                }
            }
        }

        if self.smux.version != 1 && self.smux.version != 2 {
            return err(format!(
                "invalid smux version {}: expected 1 or 2",
                self.smux.version
            ));
        }

        match self.compression.as_str() {
            "" | "none" | "snappy" => {}
            other => {
                return err(format!(
                    "invalid compression {:?}: expected 'snappy' or 'none'",
                    other
                ))
            }
        }

        if self.obfs.enabled && self.obfs.min_padding > self.obfs.max_padding {
            return err("obfs.min_padding exceeds obfs.max_padding".to_string());
        }
        if self.fragment.enabled && self.fragment.min_size > self.fragment.max_size {
            return err("fragment.min_size exceeds fragment.max_size".to_string());
        }

        Ok(())
    }

    /// True when both peers must wrap the frame stream in snappy.
    pub fn compression_enabled(&self) -> bool {
        self.compression == "snappy"
    }
}
