pub mod analyzer;
pub mod config;
pub mod reference;
pub mod scanner;

/// Audio file extensions picked up by batch discovery
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // Native (claxon)
    "flac",
    // Native (symphonia)
    "wav", "mp3", "ogg", "m4a", "aac", "mp4",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "reftrack";
