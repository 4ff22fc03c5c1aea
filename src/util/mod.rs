pub mod chatters;
pub mod env;
pub mod helix;
pub mod telemetry;
