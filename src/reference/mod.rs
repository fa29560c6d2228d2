pub mod country;
pub mod index;
pub mod loader;
