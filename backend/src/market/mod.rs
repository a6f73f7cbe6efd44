pub mod normalizer;
pub mod rolling_window;
pub mod types;
