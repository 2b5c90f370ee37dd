pub mod about;
pub mod blast;
pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod extract;
pub mod genomes;
pub mod hits;
pub mod intervals;
pub mod logging;
pub mod partition;
pub mod pipeline;
pub mod primer3;
pub mod reports;
pub mod species;
pub mod state;
pub mod tools;
pub mod validate;

pub use specprimer_protocol as protocol;
