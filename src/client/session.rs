use std::{collections::VecDeque, sync::Arc};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    config::RelayClientConfig,
    realtime::{Frame, LinkEvent, RelayConnection, RelayError},
    services::messaging::Destination,
};

use super::{
    api::{ChatApi, ClientError},
    runtime::{Effect, Notification, SessionRuntime, SessionSnapshot},
};

/// Outbound side of the relay link as the session needs it.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &Frame) -> Result<(), RelayError>;
}

impl FrameSink for RelayConnection {
    fn send_frame(&self, frame: &Frame) -> Result<(), RelayError> {
        RelayConnection::send_frame(self, frame)
    }
}

impl FrameSink for mpsc::Sender<Frame> {
    fn send_frame(&self, frame: &Frame) -> Result<(), RelayError> {
        self.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => RelayError::Closed,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Open(i64),
    Close,
    Send { destination: Destination, body: String },
    Typing(bool),
    Refresh,
    Shutdown,
}

/// Drives one [`SessionRuntime`]: relay traffic and user commands are handled
/// one at a time on a single task, and every resulting snapshot is published.
pub struct ClientSession {
    runtime: SessionRuntime,
    api: Arc<dyn ChatApi>,
    relay: Arc<dyn FrameSink>,
    snapshots: watch::Sender<SessionSnapshot>,
    notifications: Option<mpsc::Sender<Notification>>,
}

impl ClientSession {
    pub fn new(
        user_id: Uuid,
        api: Arc<dyn ChatApi>,
        relay: Arc<dyn FrameSink>,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let runtime = SessionRuntime::new(user_id);
        let (snapshots, rx) = watch::channel(runtime.snapshot());
        (
            Self {
                runtime,
                api,
                relay,
                snapshots,
                notifications: None,
            },
            rx,
        )
    }

    pub fn with_notifications(mut self, notifications: mpsc::Sender<Notification>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub async fn run(
        mut self,
        mut link: mpsc::Receiver<LinkEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut link_open = true;

        loop {
            let effects = tokio::select! {
                event = link.recv(), if link_open => match event {
                    Some(event) => self.on_link_event(event),
                    None => {
                        tracing::debug!("Relay link closed");
                        link_open = false;
                        self.runtime.on_disconnected()
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command).await,
                },
            };

            self.execute(effects).await;
            self.snapshots.send_replace(self.runtime.snapshot());
        }

        tracing::debug!("Client session for {} stopped", self.runtime.user_id());
    }

    fn on_link_event(&mut self, event: LinkEvent) -> Vec<Effect> {
        match event {
            LinkEvent::Connected => self.runtime.on_connected(),
            LinkEvent::Disconnected => self.runtime.on_disconnected(),
            LinkEvent::Frame(frame) => self.runtime.handle_frame(&frame),
        }
    }

    async fn apply(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Open(conversation_id) => self.runtime.open_conversation(conversation_id),
            Command::Close => {
                self.runtime.close_conversation();
                Vec::new()
            }
            Command::Send { destination, body } => {
                match self.api.send_message(&destination, &body).await {
                    Ok(sent) => self.runtime.message_sent(sent),
                    Err(e) => {
                        self.failed("send message", e);
                        Vec::new()
                    }
                }
            }
            Command::Typing(is_typing) => {
                if let Some(conversation_id) = self.runtime.view().conversation_id() {
                    if let Err(e) = self.api.set_typing(conversation_id, is_typing).await {
                        tracing::debug!("Typing signal failed: {}", e);
                    }
                }
                Vec::new()
            }
            Command::Refresh => {
                let mut effects = match self.api.unread_summary().await {
                    Ok(summary) => self.runtime.apply_summary(&summary),
                    Err(e) => {
                        self.failed("load unread summary", e);
                        Vec::new()
                    }
                };
                effects.push(Effect::ReloadConversations);
                effects
            }
            Command::Shutdown => Vec::new(),
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        let mut reloaded = false;

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::JoinRoom(user_id) => {
                    if let Err(e) = self.relay.send_frame(&Frame::join(user_id)) {
                        tracing::warn!("Failed to join room for {}: {}", user_id, e);
                    }
                }
                Effect::ReloadConversations => {
                    if reloaded {
                        continue;
                    }
                    reloaded = true;
                    match self.api.list_conversations().await {
                        Ok(conversations) => self.runtime.conversations_loaded(conversations),
                        Err(e) => self.failed("load conversations", e),
                    }
                }
                Effect::LoadMessages {
                    conversation_id,
                    activation,
                } => match self.api.list_messages(conversation_id, None).await {
                    Ok(messages) => queue.extend(self.runtime.messages_loaded(
                        conversation_id,
                        activation,
                        messages,
                    )),
                    Err(e) => self.failed("load messages", e),
                },
                Effect::MarkRead { conversation_id } => {
                    match self.api.mark_read(conversation_id).await {
                        Ok(receipt) => self.runtime.read_confirmed(receipt.conversation_id),
                        Err(e) => self.failed("mark conversation read", e),
                    }
                }
                Effect::Notify(notification) => {
                    if let Some(notifications) = &self.notifications {
                        if notifications.try_send(notification).is_err() {
                            tracing::debug!("Notification dropped");
                        }
                    }
                }
            }
        }
    }

    fn failed(&mut self, action: &str, error: ClientError) {
        tracing::warn!("Failed to {}: {}", action, error);
        self.runtime.command_failed(format!("Failed to {}: {}", action, error));
    }
}

/// A running session wired to a live relay link.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    relay: Arc<RelayConnection>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn connect(config: &RelayClientConfig, user_id: Uuid, api: Arc<dyn ChatApi>) -> Self {
        let (relay, link) = RelayConnection::start_listening(config);
        let relay = Arc::new(relay);
        let (session, snapshots) = ClientSession::new(user_id, api, relay.clone());
        let (commands, command_rx) = mpsc::channel(64);
        let task = tokio::spawn(session.run(link, command_rx));

        Self {
            commands,
            snapshots,
            relay,
            task,
        }
    }

    /// Returns false once the session has stopped.
    pub async fn send(&self, command: Command) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!("Client session task failed: {}", e);
        }
        self.relay.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::runtime::ViewState,
        models::{
            ConversationListItem, ConversationType, MessageView, SentMessage, UnreadSummary,
            UserSummary,
        },
        realtime::{events::MessageNew, RealtimeEvent, Room},
        services::messaging::ReadReceipt,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::{sync::Mutex, time::Duration};

    struct FakeApi {
        conversations: Vec<ConversationListItem>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeApi {
        fn with_rows(ids: &[i64]) -> Self {
            let conversations = ids
                .iter()
                .map(|&id| ConversationListItem {
                    id,
                    conversation_type: ConversationType::Direct,
                    title: None,
                    updated_at: Utc::now(),
                    unread_count: 2,
                    latest_message: None,
                    other_participants: Vec::new(),
                })
                .collect();
            Self {
                conversations,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn count(&self, call: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
        }
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn list_conversations(&self) -> Result<Vec<ConversationListItem>, ClientError> {
            self.record("list_conversations");
            Ok(self.conversations.clone())
        }

        async fn list_messages(
            &self,
            _conversation_id: i64,
            _take: Option<i64>,
        ) -> Result<Vec<MessageView>, ClientError> {
            self.record("list_messages");
            Ok(Vec::new())
        }

        async fn send_message(
            &self,
            _destination: &Destination,
            _body: &str,
        ) -> Result<SentMessage, ClientError> {
            self.record("send_message");
            Err(ClientError::Status {
                status: 404,
                message: "Conversation not found".to_string(),
            })
        }

        async fn mark_read(&self, conversation_id: i64) -> Result<ReadReceipt, ClientError> {
            self.record("mark_read");
            Ok(ReadReceipt {
                conversation_id,
                user_id: Uuid::new_v4(),
                last_read_at: Utc::now(),
            })
        }

        async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
            self.record("unread_summary");
            Ok(UnreadSummary::new(Uuid::new_v4(), Vec::new()))
        }

        async fn set_typing(&self, _conversation_id: i64, _is_typing: bool) -> Result<(), ClientError> {
            self.record("set_typing");
            Ok(())
        }
    }

    struct Harness {
        api: Arc<FakeApi>,
        frames: mpsc::Receiver<Frame>,
        link: mpsc::Sender<LinkEvent>,
        commands: mpsc::Sender<Command>,
        snapshots: watch::Receiver<SessionSnapshot>,
        notifications: mpsc::Receiver<Notification>,
        task: JoinHandle<()>,
    }

    fn start(user_id: Uuid, api: FakeApi) -> Harness {
        let api = Arc::new(api);
        let (frames_tx, frames) = mpsc::channel(8);
        let (notify_tx, notifications) = mpsc::channel(8);
        let (session, snapshots) = ClientSession::new(user_id, api.clone(), Arc::new(frames_tx));
        let session = session.with_notifications(notify_tx);
        let (link, link_rx) = mpsc::channel(8);
        let (commands, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(session.run(link_rx, command_rx));
        Harness {
            api,
            frames,
            link,
            commands,
            snapshots,
            notifications,
            task,
        }
    }

    async fn wait_until(
        snapshots: &mut watch::Receiver<SessionSnapshot>,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("session stopped")
            .clone()
    }

    #[tokio::test]
    async fn connect_joins_room_then_open_marks_read_once() {
        let user_id = Uuid::new_v4();
        let mut h = start(user_id, FakeApi::with_rows(&[1, 2]));

        h.link.send(LinkEvent::Connected).await.unwrap();
        assert_eq!(h.frames.recv().await.unwrap(), Frame::join(user_id));
        let snapshot = wait_until(&mut h.snapshots, |s| s.connected).await;
        assert_eq!(snapshot.total_unread, 4);

        h.commands.send(Command::Open(1)).await.unwrap();
        let snapshot =
            wait_until(&mut h.snapshots, |s| matches!(s.view, ViewState::Loaded { .. })).await;
        assert_eq!(snapshot.total_unread, 2);

        h.commands.send(Command::Shutdown).await.unwrap();
        h.task.await.unwrap();
        assert_eq!(h.api.count("mark_read"), 1);
        assert_eq!(h.api.count("list_messages"), 1);
    }

    #[tokio::test]
    async fn background_message_notifies() {
        let user_id = Uuid::new_v4();
        let mut h = start(user_id, FakeApi::with_rows(&[1]));
        h.link.send(LinkEvent::Connected).await.unwrap();
        wait_until(&mut h.snapshots, |s| s.connected).await;

        let event = RealtimeEvent::MessageNew(MessageNew {
            conversation_id: 1,
            message: MessageView {
                id: 10,
                content: "hello".to_string(),
                author: "Ann".to_string(),
                created_at: Utc::now(),
                sender: Some(UserSummary {
                    id: Uuid::new_v4(),
                    name: Some("Ann".to_string()),
                    image: None,
                }),
            },
        });
        let frame = event.to_frame(Some(&Room::user(user_id))).unwrap();
        h.link.send(LinkEvent::Frame(frame)).await.unwrap();

        let notification = h.notifications.recv().await.unwrap();
        assert_eq!(notification.conversation_id, 1);
        assert_eq!(notification.author, "Ann");
        let snapshot = wait_until(&mut h.snapshots, |s| s.total_unread == 3).await;
        assert_eq!(snapshot.conversations[0].unread_count, 3);

        h.commands.send(Command::Shutdown).await.unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_send_surfaces_error() {
        let mut h = start(Uuid::new_v4(), FakeApi::with_rows(&[]));

        h.commands
            .send(Command::Send {
                destination: Destination::Existing(99),
                body: "hi".to_string(),
            })
            .await
            .unwrap();

        let snapshot = wait_until(&mut h.snapshots, |s| s.last_error.is_some()).await;
        assert!(snapshot
            .last_error
            .unwrap()
            .contains("Conversation not found"));

        drop(h.commands);
        h.task.await.unwrap();
    }
}
