pub mod candidates;
pub mod db;
pub mod manager;
pub mod normalize;
pub mod plan;
pub mod run_registry;
pub mod state;
pub mod tree_matcher;
pub mod trigram;
pub mod writer;
