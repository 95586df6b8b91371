pub mod config;

pub use config::{
    BrokerSection, CommandSection, ConfigError, OverlayEntry, PaddockConfig, ShmSection,
};
