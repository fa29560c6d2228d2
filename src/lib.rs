pub mod ai;
pub mod error;
pub mod geocode;
pub mod matching;
pub mod models;
pub mod reference;
pub mod utils;
