pub mod client;
pub mod prompt;
pub mod rematcher;
pub mod response;
