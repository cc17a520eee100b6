use thiserror::Error;

/// Everything that can go wrong between the user pressing send and the
/// reply landing on disk. Network and filesystem failures are classified
/// at the boundary where they happen; raw reqwest/io errors never reach
/// the UI unformatted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChatError {
    #[error("could not reach the model server: {0}")]
    Connection(String),

    #[error("stream interrupted: {0}")]
    StreamRead(String),

    #[error("could not save conversation '{name}': {detail}")]
    Persistence { name: String, detail: String },

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("no conversation selected")]
    NoConversation,

    #[error("conversation name is empty")]
    EmptyName,

    #[error("a conversation named '{0}' already exists")]
    DuplicateName(String),

    #[error("a response is still streaming")]
    StreamInFlight,

    #[error("no conversation named '{0}'")]
    UnknownConversation(String),
}

impl ChatError {
    /// Validation problems get a quiet inline notice; everything else is
    /// shown as an error annotation.
    pub fn is_notice(&self) -> bool {
        matches!(
            self,
            ChatError::EmptyPrompt
                | ChatError::NoConversation
                | ChatError::EmptyName
                | ChatError::DuplicateName(_)
                | ChatError::StreamInFlight
                | ChatError::UnknownConversation(_)
        )
    }
}
