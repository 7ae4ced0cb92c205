pub mod client;
pub mod config;
pub mod protocol;
pub mod shutdown;
pub mod tracker;
pub mod traits;
pub mod udp_log;
pub mod wichmann_hill;
pub mod window;

#[cfg(test)]
pub mod test_utils;
