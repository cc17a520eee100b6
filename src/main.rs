mod accumulator;
mod chat;
mod config;
mod error;
mod ollama;
mod render;
mod store;

use iced::{
    widget::{button, column, container, pick_list, row, scrollable, text, text_input},
    window, Element, Font, Length, Task, Theme,
};

use chat::{ChatController, DisplayUpdate};
use error::ChatError;
use ollama::{OllamaClient, StreamEvent};
use store::{ConversationStore, Role};

fn main() -> iced::Result {
    let config = config::Config::load();

    iced::application("chatpad", App::update, App::view)
        .theme(App::theme)
        .window(window::Settings {
            size: iced::Size::new(config.window.width as f32, config.window.height as f32),
            position: window::Position::Centered,
            ..Default::default()
        })
        .default_font(Font::MONOSPACE)
        .run_with(App::new)
}

#[derive(Debug, Clone)]
enum Message {
    InputChanged(String),
    NewNameChanged(String),
    CreateConversation,
    ConversationPicked(String),
    DeleteConversation,
    ModelPicked(String),
    ModelsFetched(Vec<String>),
    Submit,
    Stop,
    Stream(u64, StreamEvent),
}

struct App {
    controller: ChatController,
    client: OllamaClient,
    models: Vec<String>,
    model: Option<String>,
    input_text: String,
    new_name: String,
    /// One display block per transcript entry; the streaming assistant
    /// message owns exactly one of them, addressed by index.
    transcript: Vec<String>,
    streaming_block: Option<usize>,
    status: String,
}

/// How a persisted message shows up when a conversation is (re)opened:
/// completed code-block structure gets the markup treatment, everything
/// else is shown as accumulated.
fn transcript_block(message: &store::Message) -> String {
    match message.role() {
        Role::User => format!("You: {}", message.text()),
        Role::Assistant if accumulator::fences_balanced(message.text()) => {
            format!("AI: {}", render::render(message.text()))
        }
        Role::Assistant => format!("AI: {}", message.text()),
    }
}

impl App {
    fn new() -> (Self, Task<Message>) {
        let config = config::Config::load();
        let client = OllamaClient::new(config.ollama.host.clone());
        let controller = ChatController::new(ConversationStore::open(&config.chat.dir));

        let transcript = controller
            .current()
            .and_then(|name| controller.messages(name))
            .map(|messages| messages.iter().map(transcript_block).collect())
            .unwrap_or_default();

        let app = App {
            controller,
            client: client.clone(),
            models: Vec::new(),
            model: None,
            input_text: String::new(),
            new_name: String::new(),
            transcript,
            streaming_block: None,
            status: String::new(),
        };

        let fallback = config.ollama.model;
        let fetch_models = Task::perform(
            async move { client.list_models(&fallback).await },
            Message::ModelsFetched,
        );

        (app, fetch_models)
    }

    /// Validation problems land in the status line; real failures go into
    /// the transcript as an inline annotation.
    fn report(&mut self, error: ChatError) {
        if error.is_notice() {
            self.status = error.to_string();
        } else {
            self.status.clear();
            self.transcript.push(format!("[error] {}", error));
        }
    }

    fn rebuild_transcript(&mut self) {
        self.transcript = self
            .controller
            .current()
            .and_then(|name| self.controller.messages(name))
            .map(|messages| messages.iter().map(transcript_block).collect())
            .unwrap_or_default();
        self.streaming_block = None;
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.input_text = value;
                Task::none()
            }
            Message::NewNameChanged(value) => {
                self.new_name = value;
                Task::none()
            }
            Message::CreateConversation => {
                match self.controller.create(&self.new_name) {
                    Ok(()) => {
                        self.new_name.clear();
                        self.status.clear();
                        self.rebuild_transcript();
                    }
                    Err(e) => self.report(e),
                }
                Task::none()
            }
            Message::ConversationPicked(name) => {
                if let Err(e) = self.controller.select(&name) {
                    self.report(e);
                } else {
                    self.rebuild_transcript();
                }
                Task::none()
            }
            Message::DeleteConversation => {
                if let Some(name) = self.controller.current().map(String::from) {
                    match self.controller.delete(&name) {
                        Ok(()) => {
                            self.status.clear();
                            self.rebuild_transcript();
                        }
                        Err(e) => self.report(e),
                    }
                }
                Task::none()
            }
            Message::ModelPicked(model) => {
                self.model = Some(model);
                Task::none()
            }
            Message::ModelsFetched(models) => {
                self.model = models.first().cloned();
                self.models = models;
                Task::none()
            }
            Message::Submit => {
                let Some(model) = self.model.clone() else {
                    self.status = "No model available.".to_string();
                    return Task::none();
                };
                let prompt = self.input_text.trim().to_string();

                match self.controller.begin_stream(&prompt) {
                    Ok((id, token)) => {
                        self.input_text.clear();
                        self.transcript.push(format!("You: {}", prompt));
                        self.transcript.push("AI: ".to_string());
                        self.streaming_block = Some(self.transcript.len() - 1);
                        self.status = format!("{} is thinking...", model);

                        let rx = self.client.start_stream(&model, &prompt, token);
                        let events = futures_util::stream::unfold(rx, |mut rx| async move {
                            rx.recv().await.map(|event| (event, rx))
                        });
                        Task::run(events, move |event| Message::Stream(id, event))
                    }
                    Err(e) => {
                        self.report(e);
                        Task::none()
                    }
                }
            }
            Message::Stop => {
                self.controller.cancel();
                if self.controller.is_streaming() {
                    self.status = "Stopping...".to_string();
                }
                Task::none()
            }
            Message::Stream(id, event) => {
                let Some(applied) = self.controller.apply_event(id, event) else {
                    return Task::none();
                };
                if let Some(warning) = applied.persist_warning {
                    self.status = warning;
                }
                match applied.display {
                    DisplayUpdate::Append(fragment) => {
                        if let Some(block) = self
                            .streaming_block
                            .and_then(|i| self.transcript.get_mut(i))
                        {
                            block.push_str(&fragment);
                        }
                    }
                    DisplayUpdate::Replace(markup) => {
                        if let Some(block) = self
                            .streaming_block
                            .and_then(|i| self.transcript.get_mut(i))
                        {
                            *block = format!("AI: {}", markup);
                        }
                    }
                    DisplayUpdate::Finished => {
                        self.streaming_block = None;
                        self.status.clear();
                    }
                    DisplayUpdate::Failed(detail) => {
                        self.streaming_block = None;
                        self.status.clear();
                        self.transcript.push(format!("[error] {}", detail));
                    }
                }
                Task::none()
            }
        }
    }

    fn view(&self) -> Element<Message> {
        let top_bar = row![
            pick_list(
                self.controller.conversation_names(),
                self.controller.current().map(String::from),
                Message::ConversationPicked,
            )
            .placeholder("Conversation"),
            text_input("New chat name...", &self.new_name)
                .on_input(Message::NewNameChanged)
                .on_submit(Message::CreateConversation)
                .width(Length::Fixed(200.0)),
            button(text("New")).on_press(Message::CreateConversation),
            button(text("Delete")).on_press(Message::DeleteConversation),
            pick_list(self.models.clone(), self.model.clone(), Message::ModelPicked)
                .placeholder("Model"),
        ]
        .spacing(10);

        let conversation = scrollable(
            container(text(self.transcript.join("\n\n")).size(15))
                .padding(15)
                .width(Length::Fill),
        )
        .height(Length::Fill);

        let input = text_input("Ask something...", &self.input_text)
            .on_input(Message::InputChanged)
            .on_submit(Message::Submit)
            .padding(12)
            .size(16);

        let send = button(text("Send")).on_press(Message::Submit);
        let stop = if self.controller.is_streaming() {
            button(text("Stop")).on_press(Message::Stop)
        } else {
            button(text("Stop"))
        };

        let bottom_bar = row![input, send, stop].spacing(10);
        let status = text(&self.status).size(14);

        container(
            column![top_bar, conversation, bottom_bar, status]
                .spacing(10)
                .padding(10),
        )
        .width(Length::Fill)
        .height(Length::Fill)
        .into()
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}
