use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_chats_dir() -> PathBuf {
    PathBuf::from("chats")
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub ollama: OllamaConfig,
    pub chat: ChatConfig,
    pub window: WindowConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChatConfig {
    #[serde(default = "default_chats_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ollama: OllamaConfig {
                host: "http://localhost:11434".to_string(),
                model: "mistral".to_string(),
            },
            chat: ChatConfig {
                dir: default_chats_dir(),
            },
            window: WindowConfig {
                width: 1100,
                height: 700,
            },
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::config_path();

        if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("Error parsing config.toml: {}. Using defaults.", e),
                },
                Err(e) => eprintln!("Error reading config.toml: {}. Using defaults.", e),
            }
        } else if let Some(parent) = config_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        Config::default()
    }

    pub fn config_path() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/chatpad/config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}
