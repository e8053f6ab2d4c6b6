//! Configuration loading and validation.
//!
//! Loads engine configuration from `./trustgate.toml` (or
//! `$TRUSTGATE_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.
//!
//! Signing keys are never read from the file itself, only the name of the
//! environment variable that holds them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::budget::SessionSettings;
use crate::hitl::HitlSettings;
use crate::risk::catalog::{
    default_actions, default_always_hitl, default_phi_resources, default_sensitivity,
};
use crate::risk::{ActionCategory, RiskParameters, Sensitivity};
use crate::signing::{HmacSigner, KeyMaterial};
use crate::token::TokenSettings;
use crate::trust::TrustSettings;

/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "TRUSTGATE_CONFIG_PATH";

/// Default env var holding the hex signing key.
pub const SIGNING_KEY_ENV: &str = "TRUSTGATE_SIGNING_KEY";

/// Tolerance when checking that risk weights sum to one.
const WEIGHT_TOLERANCE: f64 = 1e-6;

// ── Top-level config ────────────────────────────────────────────

/// Top-level engine configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Filesystem paths.
    pub paths: PathsConfig,
    /// Risk scorer weights, caps and multipliers.
    pub risk: RiskParameters,
    /// Trust defaults for new agents.
    pub trust: TrustSettings,
    /// Capability token TTLs and issuer.
    pub tokens: TokenSettings,
    /// HITL timeout and auto-approve flag.
    pub hitl: HitlSettings,
    /// Session risk ceiling.
    pub session: SessionSettings,
    /// Policy-as-data tables.
    pub policy: PolicySettings,
    /// Signing key source.
    pub signing: SigningConfig,
}

impl EngineConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = Self::config_path_with(env);
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(env);
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config file path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV).map_or_else(|| PathBuf::from("trustgate.toml"), PathBuf::from)
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Paths.
        if let Some(v) = env("TRUSTGATE_DB_PATH") {
            self.paths.database = PathBuf::from(v);
        }
        if let Some(v) = env("TRUSTGATE_LOGS_DIR") {
            self.paths.logs_dir = PathBuf::from(v);
        }

        // Session and HITL.
        override_parsed(&env, "TRUSTGATE_SESSION_RISK_CEILING", &mut self.session.risk_ceiling);
        override_parsed(&env, "TRUSTGATE_HITL_TIMEOUT_SECS", &mut self.hitl.timeout_secs);
        override_parsed(&env, "TRUSTGATE_HITL_AUTO_APPROVE", &mut self.hitl.auto_approve);

        // Signing.
        if let Some(v) = env("TRUSTGATE_SIGNING_KEY_ID") {
            self.signing.key_id = v;
        }
    }

    /// Reject configurations the engine cannot run safely with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        let total = self.risk.weights.total();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            bail!("risk weights must sum to 1.0, got {total}");
        }
        if self.risk.record_count_ceiling == 0 {
            bail!("risk.record_count_ceiling must be positive");
        }
        if !(self.risk.dollar_exposure_cap > 0.0) {
            bail!("risk.dollar_exposure_cap must be positive");
        }
        if !(self.session.risk_ceiling > 0.0) {
            bail!("session.risk_ceiling must be positive");
        }
        if self.hitl.timeout_secs == 0 {
            bail!("hitl.timeout_secs must be positive");
        }
        if !(0.0..=1.0).contains(&self.trust.default_trust) {
            bail!("trust.default_trust must be within [0, 1]");
        }
        if self.tokens.default_max_uses == 0 {
            bail!("tokens.default_max_uses must be positive");
        }
        for action in &self.policy.always_hitl_actions {
            if !self.policy.actions.contains_key(action) {
                bail!("always-HITL action {action:?} is not in the action catalog");
            }
        }
        if self.policy.business_hours_start > 23 || self.policy.business_hours_end > 24 {
            bail!("policy business hours must be within 0..24");
        }
        if self.signing.key_id.trim().is_empty() {
            bail!("signing.key_id must not be empty");
        }
        Ok(())
    }
}

fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    target: &mut T,
) {
    if let Some(v) = env(var) {
        match v.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database file.
    pub database: PathBuf,
    /// Directory for rotated JSON logs.
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = data_dir();
        Self {
            database: root.join("trustgate.db"),
            logs_dir: root.join("logs"),
        }
    }
}

/// Resolve the default data directory (`~/.trustgate/`).
///
/// Falls back to `./.trustgate` when no home directory can be determined.
pub fn data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|home| home.home_dir().join(".trustgate"))
        .unwrap_or_else(|| PathBuf::from(".trustgate"))
}

// ── Policy config ───────────────────────────────────────────────

/// Policy tables supplied as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Actions that always need a human.
    pub always_hitl_actions: Vec<String>,
    /// Action name → category.
    pub actions: HashMap<String, ActionCategory>,
    /// Resource → sensitivity tier.
    pub sensitivity: HashMap<String, Sensitivity>,
    /// Resources holding protected health information.
    pub phi_resources: Vec<String>,
    /// Tier for resources missing from `sensitivity`.
    pub default_sensitivity: Sensitivity,
    /// First working hour (UTC).
    pub business_hours_start: u32,
    /// First hour after work (UTC).
    pub business_hours_end: u32,
    /// Hours of history scanned for recent errors.
    pub error_window_hours: u32,
}

impl Default for PolicySettings {
    fn default() -> Self {
        let mut phi: Vec<String> = default_phi_resources().into_iter().collect();
        phi.sort();
        Self {
            always_hitl_actions: default_always_hitl(),
            actions: default_actions(),
            sensitivity: default_sensitivity(),
            phi_resources: phi,
            default_sensitivity: Sensitivity::Confidential,
            business_hours_start: 8,
            business_hours_end: 18,
            error_window_hours: 24,
        }
    }
}

// ── Signing config ──────────────────────────────────────────────

/// Where signing keys come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Env var holding the active hex key.
    pub key_env: String,
    /// Id recorded next to new signatures.
    pub key_id: String,
    /// Retired key id → env var holding it, kept for verification only.
    pub retired_keys: HashMap<String, String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_env: SIGNING_KEY_ENV.to_owned(),
            key_id: "k1".to_owned(),
            retired_keys: HashMap::new(),
        }
    }
}

impl SigningConfig {
    /// Build the signer from keys found through `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the active key is missing, or any key is not
    /// valid hex of at least 32 bytes.
    pub fn build_signer(&self, env: impl Fn(&str) -> Option<String>) -> Result<HmacSigner> {
        let active = env(&self.key_env).with_context(|| {
            format!(
                "signing key missing: set {} to a hex key of at least 32 bytes",
                self.key_env
            )
        })?;
        let mut signer = HmacSigner::new(
            self.key_id.clone(),
            KeyMaterial::from_hex(&self.key_id, &active)?,
        );

        let mut seen = HashSet::new();
        for (key_id, var) in &self.retired_keys {
            if !seen.insert(key_id) {
                continue;
            }
            match env(var) {
                Some(value) => {
                    signer = signer
                        .with_retired_key(key_id.clone(), KeyMaterial::from_hex(key_id, &value)?);
                }
                None => tracing::warn!(key_id = %key_id, var = %var, "retired signing key not set"),
            }
        }
        Ok(signer)
    }
}
