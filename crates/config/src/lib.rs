// Configuration loading

pub mod settings;

pub use settings::{CapabilitySettings, HttpSettings, SandboxSettings, Settings};
