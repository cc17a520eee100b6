use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::accumulator::StreamAccumulator;
use crate::error::ChatError;
use crate::ollama::StreamEvent;
use crate::render;
use crate::store::{ConversationStore, Message};

/// Transient state for one in-flight request. Owned by the controller and
/// dropped on the terminal event; never persisted.
struct StreamSession {
    id: u64,
    conversation: String,
    accumulator: StreamAccumulator,
    token: CancellationToken,
}

/// What the UI collaborator should do with the streaming message's display
/// region after one event was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayUpdate {
    /// Append the raw fragment to the current region, no reformatting.
    Append(String),
    /// A fenced block just closed: replace the whole region with this
    /// re-rendered markup.
    Replace(String),
    /// Stream ended; the assistant message is final.
    Finished,
    /// Stream failed; show the detail inline. The partial message text is
    /// kept and already persisted.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub display: DisplayUpdate,
    /// A persistence failure mid-stream is reported here instead of
    /// aborting the stream.
    pub persist_warning: Option<String>,
}

/// Orchestrates conversations: message append order, persistence after
/// every fragment, and the Idle → Streaming → Idle state machine. All
/// mutation happens here, on the foreground; the background task only
/// delivers `StreamEvent`s.
pub struct ChatController {
    store: ConversationStore,
    conversations: BTreeMap<String, Vec<Message>>,
    current: Option<String>,
    session: Option<StreamSession>,
    next_stream_id: u64,
}

impl ChatController {
    pub fn new(store: ConversationStore) -> Self {
        let conversations = store.load_all();
        let current = conversations.keys().next().cloned();
        ChatController {
            store,
            conversations,
            current,
            session: None,
            next_stream_id: 0,
        }
    }

    pub fn conversation_names(&self) -> Vec<String> {
        self.conversations.keys().cloned().collect()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn messages(&self, name: &str) -> Option<&[Message]> {
        self.conversations.get(name).map(|m| m.as_slice())
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_some()
    }

    pub fn create(&mut self, name: &str) -> Result<(), ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::EmptyName);
        }
        if self.conversations.contains_key(name) {
            return Err(ChatError::DuplicateName(name.to_string()));
        }
        self.conversations.insert(name.to_string(), Vec::new());
        self.store.save(name, &[])?;
        self.current = Some(name.to_string());
        Ok(())
    }

    pub fn select(&mut self, name: &str) -> Result<(), ChatError> {
        if !self.conversations.contains_key(name) {
            return Err(ChatError::UnknownConversation(name.to_string()));
        }
        self.current = Some(name.to_string());
        Ok(())
    }

    /// Removes a conversation and its file. If it is the one currently
    /// streaming, its session is force-cancelled and released first; a late
    /// event from the dead stream carries a stale id and is discarded.
    pub fn delete(&mut self, name: &str) -> Result<(), ChatError> {
        if !self.conversations.contains_key(name) {
            return Err(ChatError::UnknownConversation(name.to_string()));
        }
        if let Some(session) = &self.session {
            if session.conversation == name {
                session.token.cancel();
                self.session = None;
            }
        }
        self.conversations.remove(name);
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        self.store.delete(name)
    }

    /// Validates a send and moves the current conversation into Streaming:
    /// appends the user message, persists, appends the empty assistant
    /// placeholder, persists, and opens a session. Returns the stream id
    /// and the token the client stream must be started with.
    pub fn begin_stream(&mut self, prompt: &str) -> Result<(u64, CancellationToken), ChatError> {
        if self.session.is_some() {
            return Err(ChatError::StreamInFlight);
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        let name = self.current.clone().ok_or(ChatError::NoConversation)?;
        let messages = self
            .conversations
            .get_mut(&name)
            .ok_or_else(|| ChatError::UnknownConversation(name.clone()))?;

        messages.push(Message::user(prompt));
        self.store.save(&name, messages)?;
        messages.push(Message::assistant(""));
        self.store.save(&name, messages)?;

        let id = self.next_stream_id;
        self.next_stream_id += 1;
        let token = CancellationToken::new();
        self.session = Some(StreamSession {
            id,
            conversation: name,
            accumulator: StreamAccumulator::new(),
            token: token.clone(),
        });
        Ok((id, token))
    }

    /// Requests a cooperative stop. The session stays open (and send stays
    /// rejected) until the stream's terminal event arrives, so two streams
    /// can never write the same message. No-op when nothing is streaming.
    pub fn cancel(&mut self) {
        if let Some(session) = &self.session {
            session.token.cancel();
        }
    }

    /// Applies one event from the background stream on the foreground.
    /// Returns `None` for stale ids (a force-released session) or when no
    /// stream is active.
    pub fn apply_event(&mut self, stream_id: u64, event: StreamEvent) -> Option<Applied> {
        let session = self.session.as_mut()?;
        if session.id != stream_id {
            return None;
        }

        match event {
            StreamEvent::Fragment(fragment) => {
                let boundary = session.accumulator.feed(&fragment);
                let text = session.accumulator.text().to_string();
                let name = session.conversation.clone();

                let mut persist_warning = None;
                if let Some(messages) = self.conversations.get_mut(&name) {
                    if let Some(last) = messages.last_mut() {
                        last.set_text(text.clone());
                    }
                    if let Err(e) = self.store.save(&name, messages) {
                        persist_warning = Some(e.to_string());
                    }
                }

                let display = if boundary {
                    DisplayUpdate::Replace(render::render(&text))
                } else {
                    DisplayUpdate::Append(fragment)
                };
                Some(Applied {
                    display,
                    persist_warning,
                })
            }
            StreamEvent::Done => {
                self.session = None;
                Some(Applied {
                    display: DisplayUpdate::Finished,
                    persist_warning: None,
                })
            }
            StreamEvent::Failed(e) => {
                self.session = None;
                Some(Applied {
                    display: DisplayUpdate::Failed(e.to_string()),
                    persist_warning: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::store::Role;

    fn controller() -> (ChatController, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(dir.path());
        (ChatController::new(store), dir)
    }

    #[test]
    fn test_scenario_a_full_exchange_persists_two_messages() {
        let (mut ctl, dir) = controller();
        ctl.create("math").unwrap();

        let (id, _token) = ctl.begin_stream("2+2?").unwrap();
        assert!(ctl.is_streaming());

        let applied = ctl
            .apply_event(id, StreamEvent::Fragment("4".to_string()))
            .unwrap();
        assert_eq!(applied.display, DisplayUpdate::Append("4".to_string()));
        // An empty record yields no fragment at the client, so nothing
        // arrives here; the stream just closes.
        let done = ctl.apply_event(id, StreamEvent::Done).unwrap();
        assert_eq!(done.display, DisplayUpdate::Finished);
        assert!(!ctl.is_streaming());

        let messages = ctl.messages("math").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::user("2+2?"));
        assert_eq!(messages[1], Message::assistant("4"));

        let raw = std::fs::read_to_string(dir.path().join("math.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[0][1], "2+2?");
        assert_eq!(value[1][1], "4");
    }

    #[test]
    fn test_scenario_b_boundary_triggers_replace_with_markup() {
        let (mut ctl, _dir) = controller();
        ctl.create("code").unwrap();
        let (id, _token) = ctl.begin_stream("show me").unwrap();

        let first = ctl
            .apply_event(id, StreamEvent::Fragment("```py\n".to_string()))
            .unwrap();
        assert!(matches!(first.display, DisplayUpdate::Append(_)));
        let second = ctl
            .apply_event(id, StreamEvent::Fragment("x=1".to_string()))
            .unwrap();
        assert!(matches!(second.display, DisplayUpdate::Append(_)));

        let third = ctl
            .apply_event(id, StreamEvent::Fragment("\n```".to_string()))
            .unwrap();
        match third.display {
            DisplayUpdate::Replace(markup) => {
                assert!(markup.contains("<pre"));
                assert!(markup.contains("x=1"));
                assert!(!markup.contains("```"));
            }
            other => panic!("expected Replace, got {:?}", other),
        }
    }

    #[test]
    fn test_scenario_c_connection_failure_leaves_empty_assistant_message() {
        let (mut ctl, _dir) = controller();
        ctl.create("chat").unwrap();
        let (id, _token) = ctl.begin_stream("hello").unwrap();

        let applied = ctl
            .apply_event(
                id,
                StreamEvent::Failed(ChatError::Connection("timed out".to_string())),
            )
            .unwrap();
        assert!(matches!(applied.display, DisplayUpdate::Failed(_)));
        assert!(!ctl.is_streaming());

        let messages = ctl.messages("chat").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role(), Role::Assistant);
        assert_eq!(messages[1].text(), "");

        // Back to Idle: a new send is accepted.
        assert!(ctl.begin_stream("again").is_ok());
    }

    #[test]
    fn test_partial_text_survives_mid_stream_failure() {
        let (mut ctl, _dir) = controller();
        ctl.create("chat").unwrap();
        let (id, _token) = ctl.begin_stream("hello").unwrap();

        ctl.apply_event(id, StreamEvent::Fragment("partial ans".to_string()));
        ctl.apply_event(
            id,
            StreamEvent::Failed(ChatError::StreamRead("reset".to_string())),
        );

        assert_eq!(ctl.messages("chat").unwrap()[1].text(), "partial ans");
    }

    #[test]
    fn test_send_validation() {
        let (mut ctl, _dir) = controller();
        assert_eq!(ctl.begin_stream("hi").unwrap_err(), ChatError::NoConversation);

        ctl.create("chat").unwrap();
        assert_eq!(ctl.begin_stream("   ").unwrap_err(), ChatError::EmptyPrompt);
        assert!(ctl.messages("chat").unwrap().is_empty());

        ctl.begin_stream("hi").unwrap();
        assert_eq!(
            ctl.begin_stream("again").unwrap_err(),
            ChatError::StreamInFlight
        );
    }

    #[test]
    fn test_persist_failure_mid_stream_warns_but_applies_fragment() {
        let (mut ctl, dir) = controller();
        ctl.create("chat").unwrap();
        let (id, _token) = ctl.begin_stream("hi").unwrap();

        // Pull the directory out from under the store so the next save
        // fails.
        std::fs::remove_dir_all(dir.path()).unwrap();

        let applied = ctl
            .apply_event(id, StreamEvent::Fragment("still here".to_string()))
            .unwrap();
        assert!(applied.persist_warning.is_some());
        assert_eq!(
            applied.display,
            DisplayUpdate::Append("still here".to_string())
        );
        assert_eq!(ctl.messages("chat").unwrap()[1].text(), "still here");

        // The stream keeps going; a later fragment still lands.
        let next = ctl
            .apply_event(id, StreamEvent::Fragment("!".to_string()))
            .unwrap();
        assert!(next.persist_warning.is_some());
        assert_eq!(ctl.messages("chat").unwrap()[1].text(), "still here!");
    }

    #[test]
    fn test_conversation_name_validation() {
        let (mut ctl, _dir) = controller();
        assert_eq!(ctl.create("   "), Err(ChatError::EmptyName));

        ctl.create("chat").unwrap();
        assert_eq!(
            ctl.create("chat"),
            Err(ChatError::DuplicateName("chat".to_string()))
        );
    }

    #[test]
    fn test_cancel_keeps_session_until_terminal_event() {
        let (mut ctl, _dir) = controller();
        ctl.create("chat").unwrap();
        let (id, token) = ctl.begin_stream("hi").unwrap();

        ctl.cancel();
        assert!(token.is_cancelled());
        // Still waiting for the terminal signal; send stays rejected.
        assert!(ctl.is_streaming());
        assert_eq!(
            ctl.begin_stream("next").unwrap_err(),
            ChatError::StreamInFlight
        );

        ctl.apply_event(id, StreamEvent::Done);
        assert!(!ctl.is_streaming());
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let (mut ctl, _dir) = controller();
        ctl.create("chat").unwrap();
        let (id, _token) = ctl.begin_stream("hi").unwrap();
        ctl.apply_event(id, StreamEvent::Done);

        ctl.cancel();
        assert!(!ctl.is_streaming());
        assert!(ctl.begin_stream("next").is_ok());
    }

    #[test]
    fn test_delete_while_streaming_cancels_and_discards_late_events() {
        let (mut ctl, dir) = controller();
        ctl.create("doomed").unwrap();
        let (id, token) = ctl.begin_stream("hi").unwrap();

        ctl.delete("doomed").unwrap();
        assert!(token.is_cancelled());
        assert!(!ctl.is_streaming());
        assert!(!dir.path().join("doomed.json").exists());
        assert!(ctl.messages("doomed").is_none());

        // A fragment still in flight when the delete happened.
        assert!(ctl
            .apply_event(id, StreamEvent::Fragment("late".to_string()))
            .is_none());
    }

    #[test]
    fn test_stale_stream_id_is_ignored() {
        let (mut ctl, _dir) = controller();
        ctl.create("a").unwrap();
        let (old_id, _token) = ctl.begin_stream("hi").unwrap();
        ctl.apply_event(old_id, StreamEvent::Done);

        ctl.create("b").unwrap();
        let (new_id, _token) = ctl.begin_stream("next").unwrap();
        assert_ne!(old_id, new_id);
        assert!(ctl
            .apply_event(old_id, StreamEvent::Fragment("ghost".to_string()))
            .is_none());
        assert_eq!(ctl.messages("b").unwrap()[1].text(), "");
    }

    #[test]
    fn test_conversations_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConversationStore::open(dir.path());
            let mut ctl = ChatController::new(store);
            ctl.create("kept").unwrap();
            let (id, _token) = ctl.begin_stream("hi").unwrap();
            ctl.apply_event(id, StreamEvent::Fragment("there".to_string()));
            ctl.apply_event(id, StreamEvent::Done);
        }

        let reloaded = ChatController::new(ConversationStore::open(dir.path()));
        let messages = reloaded.messages("kept").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "there");
    }
}
