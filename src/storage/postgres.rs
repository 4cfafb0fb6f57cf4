use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{DeletedMessage, Store};
use crate::{
    error::{AppError, AppResult},
    models::{
        Conversation, ConversationRef, ConversationType, ConversationWithParticipants,
        MessageFilter, MessagePage, MessageView, ModeratedMessage, ModerationSender, NewMessage,
        NewUser, Participant, ParticipantWithUser, User, UserChanges, UserSummary,
    },
};

const MESSAGE_COLUMNS: &str = r#"
    m.id, m.content, m.author, m.created_at,
    u.id AS sender_user_id, u.name AS sender_name, u.image AS sender_image
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn participants_for(
        &self,
        conversation_ids: &[i64],
    ) -> AppResult<HashMap<i64, Vec<ParticipantWithUser>>> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.conversation_id, p.user_id, p.last_read_at,
                   u.id AS profile_id, u.name AS profile_name, u.image AS profile_image
            FROM conversation_participants p
            LEFT JOIN users u ON u.id = p.user_id
            WHERE p.conversation_id = ANY($1)
            ORDER BY p.id
            "#,
        )
        .bind(conversation_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<i64, Vec<ParticipantWithUser>> = HashMap::new();
        for row in rows {
            let entry = row.into_participant();
            grouped
                .entry(entry.participant.conversation_id)
                .or_default()
                .push(entry);
        }
        Ok(grouped)
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    content: String,
    author: String,
    created_at: DateTime<Utc>,
    sender_user_id: Option<Uuid>,
    sender_name: Option<String>,
    sender_image: Option<String>,
}

impl From<MessageRow> for MessageView {
    fn from(row: MessageRow) -> Self {
        let sender = row.sender_user_id.map(|id| UserSummary {
            id,
            name: row.sender_name,
            image: row.sender_image,
        });
        MessageView {
            id: row.id,
            content: row.content,
            author: row.author,
            created_at: row.created_at,
            sender,
        }
    }
}

#[derive(FromRow)]
struct ParticipantRow {
    id: i64,
    conversation_id: i64,
    user_id: Uuid,
    last_read_at: Option<DateTime<Utc>>,
    profile_id: Option<Uuid>,
    profile_name: Option<String>,
    profile_image: Option<String>,
}

impl ParticipantRow {
    fn into_participant(self) -> ParticipantWithUser {
        ParticipantWithUser {
            participant: Participant {
                id: self.id,
                conversation_id: self.conversation_id,
                user_id: self.user_id,
                last_read_at: self.last_read_at,
            },
            user: self.profile_id.map(|id| UserSummary {
                id,
                name: self.profile_name,
                image: self.profile_image,
            }),
        }
    }
}

#[derive(FromRow)]
struct ModeratedRow {
    id: i64,
    content: String,
    created_at: DateTime<Utc>,
    sender_user_id: Option<Uuid>,
    sender_name: Option<String>,
    sender_email: Option<String>,
    sender_image: Option<String>,
    conv_id: i64,
    conv_type: ConversationType,
    conv_title: Option<String>,
}

impl From<ModeratedRow> for ModeratedMessage {
    fn from(row: ModeratedRow) -> Self {
        let sender = row.sender_user_id.map(|id| ModerationSender {
            id,
            name: row.sender_name,
            email: row.sender_email.unwrap_or_default(),
            image: row.sender_image,
        });
        ModeratedMessage {
            id: row.id,
            content: row.content,
            created_at: row.created_at,
            sender,
            conversation: ConversationRef {
                id: row.conv_id,
                conversation_type: row.conv_type,
                title: row.conv_title,
            },
        }
    }
}

fn push_message_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &MessageFilter) {
    if let Some(conversation_id) = filter.conversation_id {
        qb.push(" AND m.conversation_id = ").push_bind(conversation_id);
    }
    if let Some(sender_id) = filter.sender_id {
        qb.push(" AND m.sender_id = ").push_bind(sender_id);
    }
    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        qb.push(" AND m.content ILIKE ")
            .push_bind(format!("%{}%", q));
    }
}

fn map_unique_violation(err: sqlx::Error) -> AppError {
    match err.as_database_error() {
        Some(db_err) if db_err.is_unique_violation() => AppError::UserAlreadyExists,
        _ => AppError::Database(err),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_user_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_existing_user_ids(&self, ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar("SELECT id FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn list_users(&self) -> AppResult<Vec<User>> {
        let users = sqlx::query_as("SELECT * FROM users ORDER BY email ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    async fn create_user(&self, user: NewUser) -> AppResult<User> {
        sqlx::query_as(
            r#"
            INSERT INTO users (id, email, name, role, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.role)
        .bind(&user.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(map_unique_violation)
    }

    async fn update_user(&self, id: Uuid, changes: UserChanges) -> AppResult<Option<User>> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE users SET updated_at = NOW()");
        if let Some(name) = changes.name {
            qb.push(", name = ").push_bind(name);
        }
        if let Some(email) = changes.email {
            qb.push(", email = ").push_bind(email);
        }
        if let Some(role) = changes.role {
            qb.push(", role = ").push_bind(role);
        }
        if let Some(password_hash) = changes.password_hash {
            qb.push(", password_hash = ").push_bind(password_hash);
        }
        qb.push(" WHERE id = ").push_bind(id).push(" RETURNING *");

        qb.build_query_as::<User>()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_unique_violation)
    }

    async fn delete_user(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_administrators(&self) -> AppResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'administrator'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn create_conversation(
        &self,
        conversation_type: ConversationType,
        title: Option<&str>,
    ) -> AppResult<Conversation> {
        let conversation = sqlx::query_as(
            r#"
            INSERT INTO conversations (type, title)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(conversation_type)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn touch_conversation(
        &self,
        conversation_id: i64,
        at: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        let updated: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE conversations
            SET updated_at = GREATEST($2, updated_at + INTERVAL '1 microsecond')
            WHERE id = $1
            RETURNING updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or(AppError::ConversationNotFound)
    }

    async fn find_conversation_for_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
    ) -> AppResult<Option<ConversationWithParticipants>> {
        let conversation: Option<Conversation> = sqlx::query_as(
            r#"
            SELECT c.* FROM conversations c
            WHERE c.id = $1
            AND EXISTS (
                SELECT 1 FROM conversation_participants p
                WHERE p.conversation_id = c.id AND p.user_id = $2
            )
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(conversation) = conversation else {
            return Ok(None);
        };

        let participants = self
            .participants_for(&[conversation.id])
            .await?
            .remove(&conversation.id)
            .unwrap_or_default();

        Ok(Some(ConversationWithParticipants {
            conversation,
            participants,
        }))
    }

    async fn list_conversations_for_user(
        &self,
        user_id: Uuid,
    ) -> AppResult<Vec<ConversationWithParticipants>> {
        let conversations: Vec<Conversation> = sqlx::query_as(
            r#"
            SELECT c.* FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1
            ORDER BY c.updated_at DESC, c.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = conversations.iter().map(|c| c.id).collect();
        let mut participants = self.participants_for(&ids).await?;

        Ok(conversations
            .into_iter()
            .map(|conversation| ConversationWithParticipants {
                participants: participants.remove(&conversation.id).unwrap_or_default(),
                conversation,
            })
            .collect())
    }

    async fn create_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        last_read_at: Option<DateTime<Utc>>,
    ) -> AppResult<Participant> {
        let participant = sqlx::query_as(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id, last_read_at)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(last_read_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(participant)
    }

    async fn find_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        let participant = sqlx::query_as(
            "SELECT * FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(participant)
    }

    async fn list_participations(&self, user_id: Uuid) -> AppResult<Vec<Participant>> {
        let participants = sqlx::query_as(
            "SELECT * FROM conversation_participants WHERE user_id = $1 ORDER BY conversation_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(participants)
    }

    async fn list_participants(&self, conversation_id: i64) -> AppResult<Vec<Participant>> {
        let participants = sqlx::query_as(
            "SELECT * FROM conversation_participants WHERE conversation_id = $1 ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(participants)
    }

    async fn mark_participant_read(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Participant>> {
        // GREATEST skips NULLs, so a never-read participant takes `at` directly.
        let participant = sqlx::query_as(
            r#"
            UPDATE conversation_participants
            SET last_read_at = GREATEST(last_read_at, $3)
            WHERE conversation_id = $1 AND user_id = $2
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(participant)
    }

    async fn create_message(&self, message: NewMessage) -> AppResult<MessageView> {
        let sql = format!(
            r#"
            WITH m AS (
                INSERT INTO messages (content, author, sender_id, conversation_id, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
            )
            SELECT {MESSAGE_COLUMNS} FROM m
            LEFT JOIN users u ON u.id = m.sender_id
            "#
        );
        let row: MessageRow = sqlx::query_as(&sql)
            .bind(&message.content)
            .bind(&message.author)
            .bind(message.sender_id)
            .bind(message.conversation_id)
            .bind(message.created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn latest_message(&self, conversation_id: i64) -> AppResult<Option<MessageView>> {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages m
            LEFT JOIN users u ON u.id = m.sender_id
            WHERE m.conversation_id = $1
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT 1
            "#
        );
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_messages(&self, conversation_id: i64, take: i64) -> AppResult<Vec<MessageView>> {
        let sql = format!(
            r#"
            SELECT * FROM (
                SELECT {MESSAGE_COLUMNS} FROM messages m
                LEFT JOIN users u ON u.id = m.sender_id
                WHERE m.conversation_id = $1
                ORDER BY m.created_at DESC, m.id DESC
                LIMIT $2
            ) recent
            ORDER BY created_at ASC, id ASC
            "#
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(conversation_id)
            .bind(take)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_unread(
        &self,
        conversation_id: i64,
        viewer: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> AppResult<i64> {
        let count = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = $1
            AND sender_id IS NOT NULL
            AND sender_id <> $2
            AND ($3::timestamptz IS NULL OR created_at > $3)
            "#,
        )
        .bind(conversation_id)
        .bind(viewer)
        .bind(after)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn search_messages(&self, filter: &MessageFilter) -> AppResult<MessagePage> {
        let mut items_query = QueryBuilder::<Postgres>::new(
            r#"
            SELECT m.id, m.content, m.created_at,
                   u.id AS sender_user_id, u.name AS sender_name,
                   u.email AS sender_email, u.image AS sender_image,
                   c.id AS conv_id, c.type AS conv_type, c.title AS conv_title
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            LEFT JOIN users u ON u.id = m.sender_id
            WHERE TRUE
            "#,
        );
        push_message_filters(&mut items_query, filter);
        items_query
            .push(" ORDER BY m.created_at DESC, m.id DESC LIMIT ")
            .push_bind(filter.take)
            .push(" OFFSET ")
            .push_bind(filter.skip);

        let mut count_query =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM messages m WHERE TRUE");
        push_message_filters(&mut count_query, filter);

        let (rows, total) = tokio::try_join!(
            items_query
                .build_query_as::<ModeratedRow>()
                .fetch_all(&self.pool),
            count_query
                .build_query_scalar::<i64>()
                .fetch_one(&self.pool),
        )?;

        Ok(MessagePage {
            items: rows.into_iter().map(Into::into).collect(),
            total,
            take: filter.take,
            skip: filter.skip,
        })
    }

    async fn delete_message(&self, message_id: i64) -> AppResult<Option<DeletedMessage>> {
        let deleted: Option<(i64, Option<Uuid>)> = sqlx::query_as(
            "DELETE FROM messages WHERE id = $1 RETURNING conversation_id, sender_id",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(deleted.map(|(conversation_id, sender_id)| DeletedMessage {
            conversation_id,
            sender_id,
        }))
    }
}
