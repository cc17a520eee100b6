use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn. A tuple struct so the on-disk form is the
/// 2-element `["user", "..."]` pair the file format calls for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message(pub Role, pub String);

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message(Role::Assistant, text.into())
    }

    pub fn role(&self) -> Role {
        self.0
    }

    pub fn text(&self) -> &str {
        &self.1
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.1 = text.into();
    }
}

/// One `.json` file per conversation, named after it. Pure data access;
/// the controller decides when to write.
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            eprintln!("Warning: could not create {}: {}", dir.display(), e);
        }
        ConversationStore { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Loads every `.json` file in the directory, keyed by file stem.
    /// Unreadable files are skipped with a warning so one corrupt
    /// conversation cannot take down startup.
    pub fn load_all(&self) -> BTreeMap<String, Vec<Message>> {
        let mut conversations = BTreeMap::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("Warning: could not read {}: {}", self.dir.display(), e);
                return conversations;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<Vec<Message>>(&contents) {
                    Ok(messages) => {
                        conversations.insert(name.to_string(), messages);
                    }
                    Err(e) => eprintln!("Warning: skipping {}: {}", path.display(), e),
                },
                Err(e) => eprintln!("Warning: skipping {}: {}", path.display(), e),
            }
        }

        conversations
    }

    /// Human-readable, indented, non-ASCII preserved unescaped (serde_json
    /// never escapes non-ASCII).
    pub fn save(&self, name: &str, messages: &[Message]) -> Result<(), ChatError> {
        let json = serde_json::to_string_pretty(messages).map_err(|e| ChatError::Persistence {
            name: name.to_string(),
            detail: e.to_string(),
        })?;
        fs::write(self.path(name), json).map_err(|e| ChatError::Persistence {
            name: name.to_string(),
            detail: e.to_string(),
        })
    }

    pub fn delete(&self, name: &str) -> Result<(), ChatError> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_file(&path).map_err(|e| ChatError::Persistence {
            name: name.to_string(),
            detail: e.to_string(),
        })
    }
}
