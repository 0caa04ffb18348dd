pub mod audio;
pub mod config;
pub mod consts;
pub mod coordinator;
pub mod debounce;
pub mod homeassistant;
pub mod http;
pub mod hw;
pub mod input;
pub mod relay;
pub mod router;
pub mod stats;
