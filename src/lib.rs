pub mod aws;
pub mod config;
pub mod restore;
pub mod snapshot;
pub mod targets;
pub mod wait;
pub mod zones;

#[cfg(test)]
pub(crate) mod testing;
