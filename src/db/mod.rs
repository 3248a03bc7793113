mod client;
mod models;

pub use client::{format_timestamp, parse_timestamp, Database};
pub use models::*;
