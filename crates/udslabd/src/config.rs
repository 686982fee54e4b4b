//! Device configuration
//!
//! Fully data-driven description of one simulated device: identity, listener,
//! registry, memory layout with protected ranges, security policy and the
//! built-in identifier records. Numeric fields accept plain integers or
//! `0x`-prefixed hex strings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use udslab_engine::{
    BuiltinRecord, EngineConfig, KeyListUnlock, MemorySeed, ProtectedRange, RecordGuard,
    RecordSource, SecurityPolicy, StaticKeyUnlock, UnlockStrategy, XorUnlock,
};
use udslab_node::{InstanceConfig, InstanceInfo, ListenerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("record did {0:#x} exceeds 16 bits")]
    DidTooWide(u64),

    #[error("memory seed needs exactly one of `hex` or `string`")]
    AmbiguousSeedSource,

    #[error("invalid hex in `{field}`: {message}")]
    BadHex { field: &'static str, message: String },

    #[error("unsupported listener network `{0}`, must be unix or tcp")]
    UnsupportedNetwork(String),

    #[error("listener address can not be empty")]
    EmptyListenerAddr,
}

/// Complete device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier shown by the registry
    #[serde(default = "default_id")]
    pub id: String,

    /// Device name
    #[serde(default = "default_name")]
    pub name: String,

    /// Description shown by the registry
    #[serde(default)]
    pub description: String,

    /// Listener configuration
    #[serde(default)]
    pub listener: ListenerDef,

    /// Registry configuration
    #[serde(default)]
    pub registry: RegistryDef,

    /// Security policy and unlock strategy
    #[serde(default)]
    pub security: SecurityDef,

    /// Memory layout
    #[serde(default)]
    pub memory: MemoryDef,

    /// Built-in identifier records
    #[serde(default)]
    pub records: Vec<RecordDef>,
}

fn default_id() -> String {
    "0x01".to_string()
}

fn default_name() -> String {
    "udslab-device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            name: default_name(),
            description: String::new(),
            listener: ListenerDef::default(),
            registry: RegistryDef::default(),
            security: SecurityDef::default(),
            memory: MemoryDef::default(),
            records: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// The built-in demo device: a VIN string in low memory, a guarded flag
    /// record, and a protected scratch window a tester must not reach.
    pub fn default_demo() -> Self {
        Self {
            id: "0x09".to_string(),
            name: "udslab-demo".to_string(),
            description: "Demo device: unlock security access, switch to the \
                          extended session, then read the flag at 0x1337."
                .to_string(),
            listener: ListenerDef::default(),
            registry: RegistryDef::default(),
            security: SecurityDef::default(),
            memory: MemoryDef {
                capacity: 0x100,
                seeds: vec![SeedDef {
                    offset: 0x20,
                    hex: None,
                    string: Some("UDSLAB4ALKH3X9001".to_string()),
                    null_terminated: true,
                }],
                read_protected: vec![RangeDef {
                    start: 0x50,
                    length: 0x20,
                }],
                write_protected: vec![RangeDef {
                    start: 0x50,
                    length: 0x20,
                }],
            },
            records: vec![
                RecordDef {
                    did: 0xF190,
                    source: RecordSourceDef::Memory {
                        addr: 0x20,
                        len: None,
                    },
                    guard: GuardDef::None,
                },
                RecordDef {
                    did: 0x1337,
                    source: RecordSourceDef::FixedString(
                        "flag{extended-and-unlocked}".to_string(),
                    ),
                    guard: GuardDef::ExtendedAndUnlocked,
                },
            ],
        }
    }

    /// Build the engine configuration this device describes.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut builtins = Vec::with_capacity(self.records.len());
        for record in &self.records {
            builtins.push(record.to_builtin()?);
        }

        let mut memory_seeds = Vec::with_capacity(self.memory.seeds.len());
        for seed in &self.memory.seeds {
            memory_seeds.push(seed.to_seed()?);
        }

        Ok(EngineConfig {
            memory_capacity: self.memory.capacity as usize,
            memory_seeds,
            read_protected: self.memory.read_protected.iter().map(RangeDef::to_range).collect(),
            write_protected: self
                .memory
                .write_protected
                .iter()
                .map(RangeDef::to_range)
                .collect(),
            policy: SecurityPolicy {
                max_attempts: self.security.max_attempts,
                seed_len: self.security.seed_len,
                clear_attempts_on_reset: self.security.clear_attempts_on_reset,
            },
            strategy: self.security.strategy.to_strategy()?,
            builtins,
        })
    }

    /// Build the node instance configuration this device describes.
    pub fn instance_config(&self) -> Result<InstanceConfig, ConfigError> {
        Ok(InstanceConfig {
            info: InstanceInfo {
                id: self.id.clone(),
                name: self.name.clone(),
                description: self.description.clone(),
            },
            listener: self.listener.to_listener()?,
            registry_url: self.registry.url.clone(),
            register: self.registry.register,
        })
    }
}

// =============================================================================
// Listener / Registry
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerDef {
    /// `tcp` or `unix`
    #[serde(default = "default_network")]
    pub network: String,

    /// Socket address for tcp, filesystem path for unix
    #[serde(default = "default_listen_addr")]
    pub addr: String,
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:9009".to_string()
}

impl Default for ListenerDef {
    fn default() -> Self {
        Self {
            network: default_network(),
            addr: default_listen_addr(),
        }
    }
}

impl ListenerDef {
    pub fn to_listener(&self) -> Result<ListenerConfig, ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::EmptyListenerAddr);
        }
        match self.network.as_str() {
            "tcp" => Ok(ListenerConfig::Tcp {
                addr: self.addr.clone(),
            }),
            "unix" => Ok(ListenerConfig::Unix {
                path: self.addr.clone().into(),
            }),
            other => Err(ConfigError::UnsupportedNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDef {
    /// Base URL of the registry
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Whether to announce this instance at startup
    #[serde(default = "default_register")]
    pub register: bool,
}

fn default_registry_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_register() -> bool {
    true
}

impl Default for RegistryDef {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            register: default_register(),
        }
    }
}

// =============================================================================
// Security
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityDef {
    /// Failed key submissions tolerated before lockout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Byte length of generated seeds
    #[serde(default = "default_seed_len")]
    pub seed_len: usize,

    /// Whether an ECU reset clears the failed-attempt counter
    #[serde(default)]
    pub clear_attempts_on_reset: bool,

    /// Seed-to-key comparison strategy
    #[serde(default)]
    pub strategy: StrategyDef,
}

fn default_max_attempts() -> u8 {
    3
}

fn default_seed_len() -> usize {
    8
}

impl Default for SecurityDef {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            seed_len: default_seed_len(),
            clear_attempts_on_reset: false,
            strategy: StrategyDef::default(),
        }
    }
}

/// Unlock strategy selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StrategyDef {
    /// Key = seed XOR generated secret
    #[default]
    Xor,
    /// Fixed password, hex encoded
    StaticKey { key: String },
    /// Any key from a fixed candidate list, hex encoded
    KeyList { keys: Vec<String> },
}

impl StrategyDef {
    pub fn to_strategy(&self) -> Result<Arc<dyn UnlockStrategy>, ConfigError> {
        match self {
            Self::Xor => Ok(Arc::new(XorUnlock)),
            Self::StaticKey { key } => {
                let key = hex::decode(key).map_err(|e| ConfigError::BadHex {
                    field: "security.strategy.key",
                    message: e.to_string(),
                })?;
                Ok(Arc::new(StaticKeyUnlock::new(key)))
            }
            Self::KeyList { keys } => {
                let mut candidates = Vec::with_capacity(keys.len());
                for key in keys {
                    candidates.push(hex::decode(key).map_err(|e| ConfigError::BadHex {
                        field: "security.strategy.keys",
                        message: e.to_string(),
                    })?);
                }
                Ok(Arc::new(KeyListUnlock::new(candidates)))
            }
        }
    }
}

// =============================================================================
// Memory layout
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDef {
    /// Region size in bytes
    #[serde(default = "default_capacity", with = "hexnum")]
    pub capacity: u64,

    /// Initial contents
    #[serde(default)]
    pub seeds: Vec<SeedDef>,

    /// Ranges checked reads must not touch
    #[serde(default)]
    pub read_protected: Vec<RangeDef>,

    /// Ranges checked writes must not touch
    #[serde(default)]
    pub write_protected: Vec<RangeDef>,
}

fn default_capacity() -> u64 {
    0x100
}

impl Default for MemoryDef {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            seeds: Vec::new(),
            read_protected: Vec::new(),
            write_protected: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDef {
    #[serde(with = "hexnum")]
    pub offset: u64,

    /// Hex-encoded bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,

    /// Literal string bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,

    /// Append a terminating zero byte after `string`
    #[serde(default)]
    pub null_terminated: bool,
}

impl SeedDef {
    pub fn to_seed(&self) -> Result<MemorySeed, ConfigError> {
        let data = match (&self.hex, &self.string) {
            (Some(hex), None) => hex::decode(hex).map_err(|e| ConfigError::BadHex {
                field: "memory.seeds.hex",
                message: e.to_string(),
            })?,
            (None, Some(string)) => {
                let mut bytes = string.clone().into_bytes();
                if self.null_terminated {
                    bytes.push(0);
                }
                bytes
            }
            _ => return Err(ConfigError::AmbiguousSeedSource),
        };
        Ok(MemorySeed {
            offset: self.offset,
            data,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeDef {
    #[serde(with = "hexnum")]
    pub start: u64,

    #[serde(with = "hexnum")]
    pub length: u64,
}

impl RangeDef {
    pub fn to_range(&self) -> ProtectedRange {
        ProtectedRange::new(self.start, self.length)
    }
}

// =============================================================================
// Built-in identifier records
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDef {
    #[serde(with = "hexnum")]
    pub did: u64,

    pub source: RecordSourceDef,

    #[serde(default)]
    pub guard: GuardDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSourceDef {
    /// Literal hex bytes
    FixedHex(String),
    /// Literal string bytes
    FixedString(String),
    /// A memory span; omitting `len` reads a null-terminated string
    Memory {
        #[serde(with = "hexnum")]
        addr: u64,
        #[serde(
            default,
            with = "hexnum_opt",
            skip_serializing_if = "Option::is_none"
        )]
        len: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuardDef {
    #[default]
    None,
    ExtendedAndUnlocked,
}

impl RecordDef {
    pub fn to_builtin(&self) -> Result<BuiltinRecord, ConfigError> {
        let did = u16::try_from(self.did).map_err(|_| ConfigError::DidTooWide(self.did))?;
        let source = match &self.source {
            RecordSourceDef::FixedHex(hex) => {
                RecordSource::Fixed(hex::decode(hex).map_err(|e| ConfigError::BadHex {
                    field: "records.source.fixed_hex",
                    message: e.to_string(),
                })?)
            }
            RecordSourceDef::FixedString(string) => {
                RecordSource::Fixed(string.clone().into_bytes())
            }
            RecordSourceDef::Memory { addr, len } => RecordSource::Memory {
                addr: *addr,
                len: *len,
            },
        };
        let guard = match self.guard {
            GuardDef::None => RecordGuard::None,
            GuardDef::ExtendedAndUnlocked => RecordGuard::ExtendedAndUnlocked,
        };
        Ok(BuiltinRecord { did, source, guard })
    }
}

// =============================================================================
// Hex-permissive numeric fields
// =============================================================================

mod hexnum {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => Ok(v),
            Raw::Str(s) => parse_u64(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse_u64(s: &str) -> Result<u64, String> {
        let t = s.trim();
        if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16).map_err(|e| format!("invalid hex value `{s}`: {e}"))
        } else {
            t.parse::<u64>()
                .map_err(|e| format!("invalid numeric value `{s}`: {e}"))
        }
    }
}

mod hexnum_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Int(v)) => Ok(Some(v)),
            Some(Raw::Str(s)) => super::hexnum::parse_u64(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_hex_and_int_fields() {
        let toml = r#"
[memory]
capacity = "0x200"

[[memory.seeds]]
offset = "0x20"
string = "HELLO"
null_terminated = true

[[memory.read_protected]]
start = 80
length = "0x10"
"#;
        let config: DeviceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.memory.capacity, 0x200);
        assert_eq!(config.memory.seeds[0].offset, 0x20);
        assert_eq!(config.memory.read_protected[0].start, 80);
        assert_eq!(config.memory.read_protected[0].length, 0x10);

        let seed = config.memory.seeds[0].to_seed().unwrap();
        assert_eq!(seed.data, b"HELLO\0");
    }

    #[test]
    fn parse_records_and_guards() {
        let toml = r#"
[[records]]
did = "0xF190"
source = { memory = { addr = "0x20" } }

[[records]]
did = "0x1337"
source = { fixed_string = "flag{x}" }
guard = "extended_and_unlocked"

[[records]]
did = "0xF18C"
source = { fixed_hex = "deadbeef" }
"#;
        let config: DeviceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.records.len(), 3);
        assert_eq!(config.records[1].guard, GuardDef::ExtendedAndUnlocked);

        let builtin = config.records[2].to_builtin().unwrap();
        assert_eq!(builtin.did, 0xF18C);
        assert!(
            matches!(builtin.source, udslab_engine::RecordSource::Fixed(ref b) if b == &vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
    }

    #[test]
    fn wide_did_rejected() {
        let record = RecordDef {
            did: 0x1_0000,
            source: RecordSourceDef::FixedString("x".into()),
            guard: GuardDef::None,
        };
        assert!(matches!(
            record.to_builtin(),
            Err(ConfigError::DidTooWide(0x1_0000))
        ));
    }

    #[test]
    fn strategy_parsing() {
        let toml = r#"
[security.strategy]
kind = "static_key"
key = "6c6574"
"#;
        let config: DeviceConfig = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.security.strategy,
            StrategyDef::StaticKey { .. }
        ));
        assert!(config.security.strategy.to_strategy().is_ok());

        let toml = r#"
[security.strategy]
kind = "key_list"
keys = ["01010000", "zz"]
"#;
        let config: DeviceConfig = toml::from_str(toml).unwrap();
        assert!(config.security.strategy.to_strategy().is_err());
    }

    #[test]
    fn listener_selection() {
        let def = ListenerDef {
            network: "unix".into(),
            addr: "/tmp/dev.sock".into(),
        };
        assert!(matches!(
            def.to_listener().unwrap(),
            ListenerConfig::Unix { .. }
        ));

        let def = ListenerDef {
            network: "udp".into(),
            addr: "1.2.3.4:1".into(),
        };
        assert!(matches!(
            def.to_listener(),
            Err(ConfigError::UnsupportedNetwork(_))
        ));
    }

    #[test]
    fn default_demo_builds_an_engine() {
        let config = DeviceConfig::default_demo();
        let engine_config = config.engine_config().unwrap();
        assert_eq!(engine_config.memory_capacity, 0x100);
        assert_eq!(engine_config.builtins.len(), 2);
        assert!(udslab_engine::DiagnosticEngine::new(engine_config).is_ok());
        assert!(config.instance_config().is_ok());
    }

    #[test]
    fn shipped_device_files_parse() {
        for content in [
            include_str!("../../../devices/demo.toml"),
            include_str!("../../../devices/lockout-bypass.toml"),
        ] {
            let config: DeviceConfig = toml::from_str(content).unwrap();
            assert!(config.engine_config().is_ok());
            assert!(config.instance_config().is_ok());
        }
    }

    #[test]
    fn seed_source_must_be_unambiguous() {
        let seed = SeedDef {
            offset: 0,
            hex: Some("00".into()),
            string: Some("x".into()),
            null_terminated: false,
        };
        assert!(matches!(
            seed.to_seed(),
            Err(ConfigError::AmbiguousSeedSource)
        ));
    }
}
