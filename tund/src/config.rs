//! TOML configuration surface (spec §6 CLI surface subset), loaded the way the
//! teacher's `game::core::config` loads its settings: a plain `serde`-derived struct
//! deserialized with `serdeconv`.

use flux::session::StaticKey;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Proto {
    Udp,
    TcpServer,
    TcpClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevType {
    Tun,
    Tap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    P2p,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub dh: Option<String>,
    pub tls_auth_file: Option<String>,
    pub key_method: u8,
}

impl Default for TlsConfig {
    fn default() -> TlsConfig {
        TlsConfig {
            ca: None,
            cert: None,
            key: None,
            dh: None,
            tls_auth_file: None,
            key_method: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyConfig {
    pub renegotiate_seconds: u64,
    pub renegotiate_bytes: u64,
    pub renegotiate_packets: u64,
    pub handshake_window_secs: u64,
    pub transition_window_secs: u64,
}

impl Default for RekeyConfig {
    fn default() -> RekeyConfig {
        RekeyConfig {
            renegotiate_seconds: 3600,
            renegotiate_bytes: 64 * 1024 * 1024,
            renegotiate_packets: 1 << 24,
            handshake_window_secs: 60,
            transition_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proto: Proto,
    pub local: Option<String>,
    pub remote: Option<(String, u16)>,
    pub dev: DevType,
    pub cipher: String,
    pub auth: String,
    pub secret: Option<StaticKey>,
    pub tls: Option<TlsConfig>,
    pub rekey: RekeyConfig,
    pub replay_window: usize,
    pub no_replay: bool,
    pub no_iv: bool,
    pub ping_secs: u64,
    pub ping_restart_secs: u64,
    pub ping_exit_secs: Option<u64>,
    pub inactive_secs: Option<u64>,
    pub fragment: Option<usize>,
    pub mssfix: Option<usize>,
    pub shaper_bps: Option<u64>,
    pub mode: Mode,
    pub server_net: Option<(String, String)>,
    pub client_to_client: bool,
    pub duplicate_cn: bool,
    pub max_clients: usize,
    pub tcp_queue_limit: usize,
    pub bcast_buffers: usize,
    pub hash_size: (usize, usize),
    pub explicit_exit_notify: Option<u32>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            proto: Proto::Udp,
            local: None,
            remote: None,
            dev: DevType::Tun,
            cipher: "AES-256-CBC".to_string(),
            auth: "SHA1".to_string(),
            secret: None,
            tls: None,
            rekey: RekeyConfig::default(),
            replay_window: tunnet::packet_id::DEFAULT_WINDOW_SIZE,
            no_replay: false,
            no_iv: false,
            ping_secs: 10,
            ping_restart_secs: 120,
            ping_exit_secs: None,
            inactive_secs: None,
            fragment: None,
            mssfix: None,
            shaper_bps: None,
            mode: Mode::P2p,
            server_net: None,
            client_to_client: false,
            duplicate_cn: false,
            max_clients: 1024,
            tcp_queue_limit: 64,
            bcast_buffers: 256,
            hash_size: (256, 256),
            explicit_exit_notify: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }
}
