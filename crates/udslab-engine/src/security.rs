//! Session and security-access state machine
//!
//! Tracks the diagnostic session level, unlock state, the outstanding
//! seed/secret pair and the failed-attempt counter. The seed-to-key
//! comparison is an injectable strategy so devices can model different
//! challenge schemes without touching the state machine.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use udslab_proto::session_type;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SecurityError {
    /// Too many failed key submissions; seed issuance refused
    #[error("exceeded number of attempts")]
    ExceededNumberOfAttempts,

    /// Key submitted without an outstanding seed
    #[error("request sequence error")]
    RequestSequenceError,

    /// Submitted key does not match the expected key
    #[error("invalid key")]
    InvalidKey,

    /// Operation requires the device to be unlocked
    #[error("security access denied")]
    SecurityAccessDenied,

    /// Requested session level is not a valid target
    #[error("sub-function not supported")]
    SubFunctionNotSupported,
}

/// Diagnostic session level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLevel {
    Default,
    Extended,
}

impl SessionLevel {
    pub fn code(self) -> u8 {
        match self {
            Self::Default => session_type::DEFAULT,
            Self::Extended => session_type::EXTENDED,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            session_type::DEFAULT => Some(Self::Default),
            session_type::EXTENDED => Some(Self::Extended),
            _ => None,
        }
    }
}

/// Security unlock level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Locked,
    Unlocked,
}

/// Construction-time security policy
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// Failed key submissions tolerated before seed issuance locks out
    pub max_attempts: u8,
    /// Byte length of generated seeds and secrets
    pub seed_len: usize,
    /// Whether an ECU reset clears the failed-attempt counter. Clearing it
    /// permits a lockout bypass via reset; retaining it closes that bypass.
    pub clear_attempts_on_reset: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            seed_len: 8,
            clear_attempts_on_reset: false,
        }
    }
}

/// Seed-to-key comparison strategy
pub trait UnlockStrategy: Send + Sync {
    /// Whether `key` unlocks the device for the outstanding `seed`/`secret`.
    fn accepts(&self, seed: &[u8], secret: &[u8], key: &[u8]) -> bool;
}

/// Key = seed XOR secret, byte-wise
pub struct XorUnlock;

impl UnlockStrategy for XorUnlock {
    fn accepts(&self, seed: &[u8], secret: &[u8], key: &[u8]) -> bool {
        if seed.len() != secret.len() || key.len() != seed.len() {
            return false;
        }
        let expected: Vec<u8> = seed.iter().zip(secret).map(|(s, x)| s ^ x).collect();
        key == expected.as_slice()
    }
}

/// Fixed password, independent of the seed
pub struct StaticKeyUnlock {
    key: Vec<u8>,
}

impl StaticKeyUnlock {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl UnlockStrategy for StaticKeyUnlock {
    fn accepts(&self, _seed: &[u8], _secret: &[u8], key: &[u8]) -> bool {
        key == self.key.as_slice()
    }
}

/// Membership in a fixed candidate list
pub struct KeyListUnlock {
    candidates: Vec<Vec<u8>>,
}

impl KeyListUnlock {
    pub fn new(candidates: Vec<Vec<u8>>) -> Self {
        Self { candidates }
    }
}

impl UnlockStrategy for KeyListUnlock {
    fn accepts(&self, _seed: &[u8], _secret: &[u8], key: &[u8]) -> bool {
        self.candidates.iter().any(|c| c.as_slice() == key)
    }
}

/// Mutable per-device security state
#[derive(Debug, Clone)]
pub struct EcuState {
    pub session: SessionLevel,
    pub unlock_level: AccessLevel,
    pub seed_issued: bool,
    pub failed_attempts: u8,
    pub current_seed: Option<Vec<u8>>,
    pub current_secret: Option<Vec<u8>>,
}

impl Default for EcuState {
    fn default() -> Self {
        Self::new()
    }
}

impl EcuState {
    pub fn new() -> Self {
        Self {
            session: SessionLevel::Default,
            unlock_level: AccessLevel::Locked,
            seed_issued: false,
            failed_attempts: 0,
            current_seed: None,
            current_secret: None,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlock_level == AccessLevel::Unlocked
    }

    /// Issue a fresh seed/secret pair. Refused once the attempt limit is
    /// reached; a new seed invalidates any previously issued one.
    pub fn request_seed(&mut self, policy: &SecurityPolicy) -> Result<Vec<u8>, SecurityError> {
        if self.failed_attempts >= policy.max_attempts {
            return Err(SecurityError::ExceededNumberOfAttempts);
        }

        let mut seed = vec![0u8; policy.seed_len];
        let mut secret = vec![0u8; policy.seed_len];
        OsRng.fill_bytes(&mut seed);
        OsRng.fill_bytes(&mut secret);

        self.seed_issued = true;
        self.current_seed = Some(seed.clone());
        self.current_secret = Some(secret);
        Ok(seed)
    }

    /// Check a submitted key against the outstanding seed.
    pub fn submit_key(
        &mut self,
        strategy: &dyn UnlockStrategy,
        key: &[u8],
    ) -> Result<(), SecurityError> {
        if !self.seed_issued {
            return Err(SecurityError::RequestSequenceError);
        }

        let seed = self.current_seed.as_deref().unwrap_or(&[]);
        let secret = self.current_secret.as_deref().unwrap_or(&[]);
        if strategy.accepts(seed, secret, key) {
            self.unlock_level = AccessLevel::Unlocked;
            self.seed_issued = false;
            self.current_seed = None;
            self.current_secret = None;
            Ok(())
        } else {
            self.failed_attempts = self.failed_attempts.saturating_add(1);
            Err(SecurityError::InvalidKey)
        }
    }

    /// Switch the session level. Requires unlock, re-validated on every call.
    pub fn request_session(&mut self, target: u8) -> Result<SessionLevel, SecurityError> {
        if !self.is_unlocked() {
            return Err(SecurityError::SecurityAccessDenied);
        }
        let level =
            SessionLevel::from_code(target).ok_or(SecurityError::SubFunctionNotSupported)?;
        self.session = level;
        Ok(level)
    }

    /// Reset to the locked default session. The attempt counter is cleared
    /// only when the policy says so.
    pub fn reset(&mut self, policy: &SecurityPolicy) {
        self.session = SessionLevel::Default;
        self.unlock_level = AccessLevel::Locked;
        self.seed_issued = false;
        self.current_seed = None;
        self.current_secret = None;
        if policy.clear_attempts_on_reset {
            self.failed_attempts = 0;
        }
    }
}
