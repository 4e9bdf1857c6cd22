//! Configuration schema for ggz players and self-play workers.
//!
//! Every field has a default. Loading is permissive for the settings that
//! only tune search: a missing field or an unknown `choose` method is logged
//! and replaced by its default. Malformed YAML and failed validation are
//! errors.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Search settings for a playing (non self-play) evaluator.
    #[serde(default)]
    pub puct: PuctConfig,
    /// Self-play settings.
    #[serde(default)]
    pub selfplay: SelfPlayConfig,
    /// Inference host settings.
    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Move choice policy once search has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChooseFn {
    /// Most visited root child; ties broken by mean value.
    #[default]
    TopVisits,
    /// Sample proportionally to `visits^(1/T)`.
    Temperature,
}

impl ChooseFn {
    pub fn as_str(self) -> &'static str {
        match self {
            ChooseFn::TopVisits => "choose_top_visits",
            ChooseFn::Temperature => "choose_temperature",
        }
    }

    /// Parse a method name, falling back to top visits for unknown names.
    pub fn parse_or_default(name: &str) -> Self {
        match name {
            "choose_top_visits" => ChooseFn::TopVisits,
            "choose_temperature" => ChooseFn::Temperature,
            other => {
                tracing::error!("Choose method unknown: '{other}', setting to top visits");
                ChooseFn::TopVisits
            }
        }
    }
}

impl Serialize for ChooseFn {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChooseFn {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        Ok(ChooseFn::parse_or_default(&name))
    }
}

/// PUCT evaluator configuration. One immutable value per evaluator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PuctConfig {
    /// Log a tree dump after every move.
    pub verbose: bool,

    /// Exploration weight below the root.
    pub puct_constant: f32,
    /// Exploration weight at the root.
    pub puct_constant_root: f32,

    /// Fraction of root prior replaced by Dirichlet noise (0 disables noise).
    pub dirichlet_noise_pct: f32,
    /// Dirichlet alpha; `<= 0` means `10 / num_children`.
    pub dirichlet_noise_alpha: f32,
    /// How far root priors are pulled toward uniform when squashing.
    pub noise_policy_squash_pct: f32,
    /// Probability that root priors are squashed before noise is mixed in.
    pub noise_policy_squash_prob: f32,

    /// Depth limit of verbose tree dumps.
    pub max_dump_depth: u32,

    /// Scale of the uniform draw used by temperature sampling (1.0 = unbiased).
    pub random_scale: f32,
    pub temperature: f32,
    pub depth_temperature_start: u32,
    pub depth_temperature_increment: f32,
    /// At or beyond this game depth moves are chosen greedily (0 disables).
    pub depth_temperature_stop: u32,
    /// Cap on the depth-dependent temperature divisor.
    pub depth_temperature_max: f32,

    /// First-play-urgency discount below the root.
    pub fpu_prior_discount: f32,
    /// First-play-urgency discount at the root.
    pub fpu_prior_discount_root: f32,

    pub choose: ChooseFn,

    /// Seconds of search per move; `<= 0` leaves the deadline to the caller.
    pub think_time: f32,
    /// Consecutive converged checks needed to stop early (0 disables).
    pub converged_visits: u32,
    /// Top root child must have more than `ratio` times every sibling's visits.
    pub top_visits_best_guess_converge_ratio: f32,
    /// While unconverged, keep searching up to `evaluations * multiplier`.
    pub evaluation_multiplier_to_convergence: f32,

    /// Maximum leaf-evaluation requests per batch.
    pub batch_size: usize,

    /// Game depth at which non-terminal nodes are scored as draws (0 disables).
    pub use_legals_count_draw: i32,
    /// Propagate solved (finalised) values up the tree.
    pub backup_finalised: bool,
    /// Share nodes between equal states at the same depth.
    pub lookup_transpositions: bool,
}

impl Default for PuctConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            puct_constant: 0.85,
            puct_constant_root: 0.85,
            dirichlet_noise_pct: 0.25,
            dirichlet_noise_alpha: -1.0,
            noise_policy_squash_pct: 0.0,
            noise_policy_squash_prob: 0.0,
            max_dump_depth: 2,
            random_scale: 1.0,
            temperature: 1.0,
            depth_temperature_start: 5,
            depth_temperature_increment: 0.5,
            depth_temperature_stop: 10,
            depth_temperature_max: 5.0,
            fpu_prior_discount: 0.25,
            fpu_prior_discount_root: 0.1,
            choose: ChooseFn::TopVisits,
            think_time: 10.0,
            converged_visits: 0,
            top_visits_best_guess_converge_ratio: 2.0,
            evaluation_multiplier_to_convergence: 1.0,
            batch_size: 32,
            use_legals_count_draw: 0,
            backup_finalised: true,
            lookup_transpositions: false,
        }
    }
}

const PUCT_FIELDS: &[&str] = &[
    "verbose",
    "puct_constant",
    "puct_constant_root",
    "dirichlet_noise_pct",
    "dirichlet_noise_alpha",
    "noise_policy_squash_pct",
    "noise_policy_squash_prob",
    "max_dump_depth",
    "random_scale",
    "temperature",
    "depth_temperature_start",
    "depth_temperature_increment",
    "depth_temperature_stop",
    "depth_temperature_max",
    "fpu_prior_discount",
    "fpu_prior_discount_root",
    "choose",
    "think_time",
    "converged_visits",
    "top_visits_best_guess_converge_ratio",
    "evaluation_multiplier_to_convergence",
    "batch_size",
    "use_legals_count_draw",
    "backup_finalised",
    "lookup_transpositions",
];

impl PuctConfig {
    /// Parse a standalone PUCT section, logging every missing field.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        warn_missing_fields("puct", &value, PUCT_FIELDS);
        let conf: PuctConfig = serde_yaml::from_value(value)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Hard constraints; everything else is clamped where it is used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size < 1 {
            return Err(ConfigError::Invalid("batch_size must be >= 1".into()));
        }
        for (name, v) in [
            ("puct_constant", self.puct_constant),
            ("puct_constant_root", self.puct_constant_root),
            ("fpu_prior_discount", self.fpu_prior_discount),
            ("fpu_prior_discount_root", self.fpu_prior_discount_root),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be finite and >= 0")));
            }
        }
        for (name, v) in [
            ("dirichlet_noise_pct", self.dirichlet_noise_pct),
            ("noise_policy_squash_pct", self.noise_policy_squash_pct),
            ("noise_policy_squash_prob", self.noise_policy_squash_prob),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be in [0, 1]")));
            }
        }
        if !self.temperature.is_finite() {
            return Err(ConfigError::Invalid("temperature must be finite".into()));
        }
        if !(self.top_visits_best_guess_converge_ratio.is_finite()
            && self.top_visits_best_guess_converge_ratio > 0.0)
        {
            return Err(ConfigError::Invalid(
                "top_visits_best_guess_converge_ratio must be finite and > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Self-play configuration: search settings plus game-level policies.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelfPlayConfig {
    pub puct_config: PuctConfig,
    pub evals_per_move: u32,

    /// Probability that a move is searched fully and recorded as a sample.
    pub oscillate_sampling_pct: f32,
    /// Temperature applied to root visits when writing the policy target.
    pub temperature_for_policy: f32,

    pub resign0_score_probability: f32,
    pub resign0_pct: f32,
    pub resign1_score_probability: f32,
    pub resign1_pct: f32,

    /// Probability that a would-be resignation instead plays on to the end.
    pub run_to_end_pct: f32,
    pub run_to_end_evals: u32,
    pub run_to_end_puct_config: PuctConfig,
    /// While running to the end, a lead-role score below this ends the game.
    pub run_to_end_early_score: f32,
    /// Resignation is never considered before this depth.
    pub run_to_end_minimum_game_depth: u32,

    /// Abort games longer than this many plies (0 disables).
    pub abort_max_length: u32,
    /// A state seen this many times ends the game (0 disables).
    pub number_repeat_states_draw: u32,
    /// Score every role receives on a repetition draw.
    pub repeat_states_score: f32,
}

impl Default for SelfPlayConfig {
    fn default() -> Self {
        Self {
            puct_config: PuctConfig {
                choose: ChooseFn::Temperature,
                ..PuctConfig::default()
            },
            evals_per_move: 200,
            oscillate_sampling_pct: 1.0,
            temperature_for_policy: 1.0,
            resign0_score_probability: 0.05,
            resign0_pct: 0.5,
            resign1_score_probability: 0.1,
            resign1_pct: 0.3,
            run_to_end_pct: 0.1,
            run_to_end_evals: 32,
            run_to_end_puct_config: PuctConfig {
                dirichlet_noise_pct: 0.0,
                ..PuctConfig::default()
            },
            run_to_end_early_score: 0.01,
            run_to_end_minimum_game_depth: 4,
            abort_max_length: 0,
            number_repeat_states_draw: 0,
            repeat_states_score: 0.5,
        }
    }
}

impl SelfPlayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.puct_config.validate()?;
        self.run_to_end_puct_config.validate()?;
        // one scheduler serves the whole game, sized from puct_config
        if self.run_to_end_puct_config.batch_size != self.puct_config.batch_size {
            return Err(ConfigError::Invalid(format!(
                "run_to_end_puct_config.batch_size ({}) must equal puct_config.batch_size ({})",
                self.run_to_end_puct_config.batch_size, self.puct_config.batch_size
            )));
        }
        if self.evals_per_move == 0 {
            return Err(ConfigError::Invalid("evals_per_move must be > 0".into()));
        }
        for (name, v) in [
            ("oscillate_sampling_pct", self.oscillate_sampling_pct),
            ("resign0_pct", self.resign0_pct),
            ("resign1_pct", self.resign1_pct),
            ("run_to_end_pct", self.run_to_end_pct),
            ("repeat_states_score", self.repeat_states_score),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be in [0, 1]")));
            }
        }
        Ok(())
    }
}

/// Inference host endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// `tcp://host:port` or `unix:///path/to.sock`.
    pub endpoint: String,
    /// Read timeout for one batch round trip in milliseconds (0 = none).
    pub timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///tmp/ggz_infer.sock".to_string(),
            timeout_ms: 0,
        }
    }
}

fn warn_missing_fields(section: &str, value: &serde_yaml::Value, fields: &[&str]) {
    let Some(map) = value.as_mapping() else {
        return;
    };
    for &name in fields {
        if !map.contains_key(name) {
            tracing::warn!("{section}: missing field '{name}', using default");
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        if let Some(puct) = value.get("puct") {
            warn_missing_fields("puct", puct, PUCT_FIELDS);
        }
        if let Some(sp) = value.get("selfplay") {
            for key in ["puct_config", "run_to_end_puct_config"] {
                if let Some(section) = sp.get(key) {
                    warn_missing_fields(key, section, PUCT_FIELDS);
                }
            }
        }
        let config: Config = serde_yaml::from_value(value)?;
        config.puct.validate()?;
        config.selfplay.validate()?;
        Ok(config)
    }
}
