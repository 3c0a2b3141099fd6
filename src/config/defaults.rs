//! Default values for configuration fields

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_port() -> u16 {
    5000
}

pub fn default_ffmpeg_command() -> String {
    "ffmpeg".to_string()
}

pub fn default_yt_dlp_command() -> String {
    "yt-dlp".to_string()
}

pub fn default_config_file() -> String {
    "config.yaml".to_string()
}
