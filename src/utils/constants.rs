// src/utils/constants.rs

/// Score tiers on a 0..=1000 scale. Higher is more confident.
pub const EXACT_MATCH_SCORE: i32 = 700;
pub const REFERENCE_VARIANT_SCORE: i32 = 650;
pub const PREFIX_MATCH_SCORE: i32 = 550;
/// Trigram similarity is multiplied by this, so the best fuzzy hit stays below the exact tiers.
pub const TRIGRAM_SCORE_SCALE: f64 = 600.0;

pub const SCOPE_BONUS: i32 = 100;
pub const SINGLE_CANDIDATE_BONUS: i32 = 100;

pub const DEFAULT_AUTO_ACCEPT_SCORE: i32 = 650;
pub const DEFAULT_TRIGRAM_MIN_SIMILARITY: f64 = 0.35;

/// Prefix matching needs a stem of at least this many characters...
pub const PREFIX_MIN_CHARS: usize = 4;
/// ...covering at least this share of the longer name.
pub const PREFIX_MIN_RATIO: f64 = 0.6;

/// Upper bound of trigram hits considered per lookup.
pub const MAX_TRIGRAM_CANDIDATES: usize = 10;
/// Upper bound of suggestions stored per region by the tree matcher.
pub const MAX_SUGGESTIONS_PER_REGION: usize = 5;

pub const DEFAULT_AI_BATCH_SIZE: usize = 25;
/// Scores of model-proposed suggestions by stated confidence.
pub const AI_HIGH_CONFIDENCE_SCORE: i32 = 600;
pub const AI_MEDIUM_CONFIDENCE_SCORE: i32 = 500;
pub const AI_LOW_CONFIDENCE_SCORE: i32 = 400;
/// Pre-pass candidates merged into a single-region prompt.
pub const AI_PRE_PASS_CANDIDATES: usize = 3;

/// Geocode search rounds. `None` is exact point-in-polygon containment.
pub const GEOCODE_SEARCH_RADII_KM: [Option<f64>; 4] = [None, Some(10.0), Some(50.0), Some(200.0)];
pub const GEOCODE_EXACT_SCORE: i32 = 500;
pub const GEOCODE_RADIUS_STEP_PENALTY: i32 = 50;
pub const GEOCODE_MIN_INTERVAL_MS: u64 = 1000;
pub const GEOCODE_CACHE_SIZE: usize = 512;

pub const DEFAULT_CONTINENT_NAMES: [&str; 9] = [
    "africa",
    "antarctica",
    "asia",
    "europe",
    "north america",
    "south america",
    "oceania",
    "australia and oceania",
    "central america",
];

/// Administrative suffixes stripped by the name normalizer, longest first so
/// that "autonomous okrug" wins over "okrug".
pub const ADMINISTRATIVE_SUFFIXES: [&str; 31] = [
    "autonomous republic",
    "autonomous region",
    "autonomous okrug",
    "autonomous oblast",
    "autonomous community",
    "metropolitan city",
    "special region",
    "capital district",
    "federal district",
    "governorate",
    "voivodeship",
    "municipality",
    "prefecture",
    "department",
    "territory",
    "province",
    "republic",
    "district",
    "region",
    "county",
    "commune",
    "canton",
    "oblast",
    "emirate",
    "parish",
    "okrug",
    "state",
    "krai",
    "kray",
    "raion",
    "division",
];

/// Leading forms such as "Republic of Tatarstan".
pub const ADMINISTRATIVE_PREFIXES: [&str; 6] = [
    "republic of ",
    "province of ",
    "state of ",
    "region of ",
    "city of ",
    "department of ",
];
