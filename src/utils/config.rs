// src/utils/config.rs
//! Engine configuration read from environment variables.

use log::info;
use std::fmt;

use crate::reference::country::CountryRule;
use crate::utils::constants::{
    DEFAULT_AI_BATCH_SIZE, DEFAULT_AUTO_ACCEPT_SCORE, DEFAULT_CONTINENT_NAMES,
    DEFAULT_TRIGRAM_MIN_SIMILARITY,
};
use crate::utils::env::{env_or, env_string};

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub auto_accept_score: i32,
    pub trigram_min_similarity: f64,
    pub country_rule: CountryRule,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            auto_accept_score: DEFAULT_AUTO_ACCEPT_SCORE,
            trigram_min_similarity: DEFAULT_TRIGRAM_MIN_SIMILARITY,
            country_rule: CountryRule::heuristic(DEFAULT_CONTINENT_NAMES.iter().copied()),
        }
    }
}

impl MatcherConfig {
    pub fn from_env() -> Self {
        let continents_raw = env_string("CONTINENT_NAMES", "");
        let continents: Vec<String> = if continents_raw.is_empty() {
            DEFAULT_CONTINENT_NAMES.iter().map(|s| s.to_string()).collect()
        } else {
            continents_raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let rule_raw = env_string("COUNTRY_RULE", "heuristic");
        let country_rule = CountryRule::parse(&rule_raw, continents.iter().map(|s| s.as_str()))
            .unwrap_or_else(|e| {
                log::warn!("Invalid COUNTRY_RULE '{}': {}. Using heuristic rule.", rule_raw, e);
                CountryRule::heuristic(continents.iter().map(|s| s.as_str()))
            });

        let trigram_min_similarity =
            env_or("TRIGRAM_MIN_SIMILARITY", DEFAULT_TRIGRAM_MIN_SIMILARITY).clamp(0.1, 1.0);

        Self {
            auto_accept_score: env_or("AUTO_ACCEPT_SCORE", DEFAULT_AUTO_ACCEPT_SCORE),
            trigram_min_similarity,
            country_rule,
        }
    }
}

#[derive(Clone)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub input_price_per_mtok: f64,
    pub output_price_per_mtok: f64,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[hidden]"))
            .field("model", &self.model)
            .field("input_price_per_mtok", &self.input_price_per_mtok)
            .field("output_price_per_mtok", &self.output_price_per_mtok)
            .field("batch_size", &self.batch_size)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            input_price_per_mtok: 0.15,
            output_price_per_mtok: 0.60,
            batch_size: DEFAULT_AI_BATCH_SIZE,
            timeout_secs: 120,
        }
    }
}

impl AiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: env_string("LLM_API_URL", &defaults.api_url),
            api_key: std::env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            model: env_string("LLM_MODEL", &defaults.model),
            input_price_per_mtok: env_or("LLM_INPUT_PRICE_PER_MTOK", defaults.input_price_per_mtok),
            output_price_per_mtok: env_or(
                "LLM_OUTPUT_PRICE_PER_MTOK",
                defaults.output_price_per_mtok,
            ),
            batch_size: env_or("AI_BATCH_SIZE", defaults.batch_size).max(1),
            timeout_secs: env_or("LLM_TIMEOUT_SECS", defaults.timeout_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeocodeConfig {
    pub url: String,
    pub user_agent: String,
    pub max_retries: usize,
    pub timeout_secs: u64,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            url: "https://nominatim.openstreetmap.org/search".to_string(),
            user_agent: "region_matching/0.1".to_string(),
            max_retries: 3,
            timeout_secs: 20,
        }
    }
}

impl GeocodeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_string("GEOCODER_URL", &defaults.url),
            user_agent: env_string("GEOCODER_USER_AGENT", &defaults.user_agent),
            max_retries: env_or("GEOCODER_MAX_RETRIES", defaults.max_retries).max(1),
            timeout_secs: env_or("GEOCODER_TIMEOUT_SECS", defaults.timeout_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Finished runs stay pollable this long.
    pub retention_secs: u64,
    /// Single-region operations reuse a loaded index this long.
    pub index_cache_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            index_cache_secs: 600,
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retention_secs: env_or("RUN_RETENTION_SECS", defaults.retention_secs),
            index_cache_secs: env_or("INDEX_CACHE_SECS", defaults.index_cache_secs),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub matcher: MatcherConfig,
    pub ai: AiConfig,
    pub geocode: GeocodeConfig,
    pub runs: RunConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            matcher: MatcherConfig::from_env(),
            ai: AiConfig::from_env(),
            geocode: GeocodeConfig::from_env(),
            runs: RunConfig::from_env(),
        }
    }

    pub fn log_config(&self) {
        info!("⚙️  Matching configuration:");
        info!("   • Auto-accept score: {}", self.matcher.auto_accept_score);
        info!("   • Trigram floor: {:.2}", self.matcher.trigram_min_similarity);
        info!("   • Country rule: {}", self.matcher.country_rule);
        info!(
            "   • LLM: {} at {} (batch size {}, key {})",
            self.ai.model,
            self.ai.api_url,
            self.ai.batch_size,
            if self.ai.api_key.is_some() { "set" } else { "missing" }
        );
        info!("   • Geocoder: {}", self.geocode.url);
        info!(
            "   • Run retention: {}s, index cache: {}s",
            self.runs.retention_secs, self.runs.index_cache_secs
        );
    }
}
