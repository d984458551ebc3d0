pub mod api;
pub mod config;
pub mod internal;
pub mod utils;
