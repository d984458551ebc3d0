pub mod capture;
pub mod compare;
pub mod diff;
pub mod fetcher;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod store;
