pub mod core;
pub mod stats_models;

pub use self::core::{
    DivisionId, HierarchyId, ImportRegion, ImportTree, MatchStatus, ReferenceDivision, RegionId,
    SuggestionSource,
};
