//! SQLite repository. All database access in the workspace goes through the
//! typed methods here; no other crate holds SQL.

use std::collections::HashSet;

use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use dg_domain::config::{McpServerConfig, McpTransportKind};
use dg_domain::error::{Error, Result};

use crate::entities::{
    Conversation, ConversationState, LlmModelRow, McpServerRow, McpToolRow, MessageRole,
    MessageRow, NewMessage, SkillRow, User,
};

const SCHEMA: &str = include_str!("schema.sql");

fn db(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Connect to the given sqlx SQLite URL, creating the database file if
    /// needed, and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(db)?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    /// An in-memory database on a single connection (tests, title tasks in
    /// tests). A single connection is required because every `:memory:`
    /// connection is its own database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await.map_err(db)?;
        }
        tracing::debug!("schema applied");
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Conversations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn create_conversation(
        &self,
        owner_user_id: i64,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let state = serde_json::to_string(&ConversationState::default())?;
        let id = sqlx::query(
            "INSERT INTO conversations (owner_user_id, title, created_at, updated_at, state) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(owner_user_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .last_insert_rowid();

        self.get_conversation(id)
            .await?
            .ok_or_else(|| Error::not_found("conversation", id))
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(|r| conversation_from_row(&r)).transpose()
    }

    /// Non-archived conversations owned by the user, newest first.
    pub async fn list_conversations(&self, owner_user_id: i64) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations \
             WHERE owner_user_id = ? AND archived = 0 \
             ORDER BY updated_at DESC",
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn delete_conversation(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    pub async fn set_archived(&self, id: i64, archived: bool) -> Result<()> {
        sqlx::query("UPDATE conversations SET archived = ?, updated_at = ? WHERE id = ?")
            .bind(archived)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    pub async fn set_starred(&self, id: i64, starred: bool) -> Result<()> {
        sqlx::query("UPDATE conversations SET starred = ?, updated_at = ? WHERE id = ?")
            .bind(starred)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    /// Write a title only while the conversation still has none. Returns
    /// whether the write happened, which makes concurrent title tasks
    /// naturally idempotent.
    pub async fn set_title_if_missing(&self, id: i64, title: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET title = ?, updated_at = ? \
             WHERE id = ? AND (title IS NULL OR trim(title) = '')",
        )
        .bind(title)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn save_state(&self, id: i64, state: &ConversationState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        sqlx::query("UPDATE conversations SET state = ?, updated_at = ? WHERE id = ?")
            .bind(json)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Messages
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Highest step_order in the conversation, 0 when it has no messages.
    pub async fn max_step_order(&self, conversation_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(step_order), 0) AS max_step FROM messages \
             WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        row.try_get("max_step").map_err(db)
    }

    pub async fn insert_message(&self, msg: &NewMessage) -> Result<i64> {
        let tool_calls = msg
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let id = sqlx::query(
            "INSERT INTO messages \
             (conversation_id, step_order, role, content, tool_calls, tool_name, \
              tool_call_id, tool_return_content, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(msg.conversation_id)
        .bind(msg.step_order)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(tool_calls)
        .bind(&msg.tool_name)
        .bind(&msg.tool_call_id)
        .bind(&msg.tool_return_content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db)?
        .last_insert_rowid();
        Ok(id)
    }

    /// All messages of a conversation in `step_order`.
    pub async fn list_messages(&self, conversation_id: i64) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY step_order",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(message_from_row).collect()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Users / roles / departments
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        let Some(row) = row else { return Ok(None) };

        let role_rows = sqlx::query("SELECT role_id FROM user_roles WHERE user_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let role_ids = role_rows
            .iter()
            .map(|r| r.try_get("role_id").map_err(db))
            .collect::<Result<Vec<i64>>>()?;

        Ok(Some(User {
            id: row.try_get("id").map_err(db)?,
            username: row.try_get("username").map_err(db)?,
            is_admin: row.try_get("is_admin").map_err(db)?,
            is_active: row.try_get("is_active").map_err(db)?,
            department_id: row.try_get("department_id").map_err(db)?,
            role_ids,
        }))
    }

    pub async fn insert_user(
        &self,
        username: &str,
        is_admin: bool,
        department_id: Option<i64>,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO users (username, is_admin, department_id) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(is_admin)
        .bind(department_id)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn insert_department(&self, name: &str) -> Result<i64> {
        let id = sqlx::query("INSERT INTO departments (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db)?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn insert_role(&self, name: &str) -> Result<i64> {
        let id = sqlx::query("INSERT INTO roles (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db)?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn assign_role(&self, user_id: i64, role_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // MCP tools + permissions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn insert_mcp_tool(
        &self,
        name: &str,
        description: Option<&str>,
        server_name: Option<&str>,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO mcp_tools (name, description, server_name) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(server_name)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn list_mcp_tools(&self, active_only: bool) -> Result<Vec<McpToolRow>> {
        let sql = if active_only {
            "SELECT * FROM mcp_tools WHERE is_active = 1 ORDER BY name"
        } else {
            "SELECT * FROM mcp_tools ORDER BY name"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(db)?;
        rows.iter()
            .map(|r| {
                Ok(McpToolRow {
                    id: r.try_get("id").map_err(db)?,
                    name: r.try_get("name").map_err(db)?,
                    description: r.try_get("description").map_err(db)?,
                    server_name: r.try_get("server_name").map_err(db)?,
                    is_active: r.try_get("is_active").map_err(db)?,
                })
            })
            .collect()
    }

    pub async fn active_tool_names(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT name FROM mcp_tools WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(db))
            .collect()
    }

    pub async fn set_role_tool_permission(
        &self,
        role_id: i64,
        tool_id: i64,
        can_use: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO role_tool_permissions (role_id, tool_id, can_use) VALUES (?, ?, ?) \
             ON CONFLICT (role_id, tool_id) DO UPDATE SET can_use = excluded.can_use",
        )
        .bind(role_id)
        .bind(tool_id)
        .bind(can_use)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    pub async fn set_department_tool_permission(
        &self,
        department_id: i64,
        tool_id: i64,
        is_allowed: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO department_tool_permissions (department_id, tool_id, is_allowed) \
             VALUES (?, ?, ?) \
             ON CONFLICT (department_id, tool_id) DO UPDATE SET is_allowed = excluded.is_allowed",
        )
        .bind(department_id)
        .bind(tool_id)
        .bind(is_allowed)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    /// Names of active tools granted through any of the given roles.
    pub async fn tool_names_for_roles(&self, role_ids: &[i64]) -> Result<HashSet<String>> {
        if role_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; role_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT t.name FROM mcp_tools t \
             JOIN role_tool_permissions p ON p.tool_id = t.id \
             WHERE p.role_id IN ({placeholders}) AND p.can_use = 1 AND t.is_active = 1"
        );
        let mut query = sqlx::query(&sql);
        for id in role_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(db))
            .collect()
    }

    /// Names of tools the department has explicitly blocked.
    pub async fn tool_names_blocked_for_department(
        &self,
        department_id: i64,
    ) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT t.name FROM mcp_tools t \
             JOIN department_tool_permissions p ON p.tool_id = t.id \
             WHERE p.department_id = ? AND p.is_allowed = 0",
        )
        .bind(department_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(db))
            .collect()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Skills + permissions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Insert or refresh the row for an installed skill (name is unique).
    pub async fn upsert_skill(
        &self,
        name: &str,
        version: &str,
        description: &str,
        path: &str,
        tags: &[String],
    ) -> Result<i64> {
        let tags_json = serde_json::to_string(tags)?;
        sqlx::query(
            "INSERT INTO skills (name, version, description, path, tags) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (name) DO UPDATE SET \
               version = excluded.version, description = excluded.description, \
               path = excluded.path, tags = excluded.tags",
        )
        .bind(name)
        .bind(version)
        .bind(description)
        .bind(path)
        .bind(tags_json)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        let row = sqlx::query("SELECT id FROM skills WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        row.try_get("id").map_err(db)
    }

    pub async fn list_skills(&self, active_only: bool) -> Result<Vec<SkillRow>> {
        let sql = if active_only {
            "SELECT * FROM skills WHERE is_active = 1 ORDER BY name"
        } else {
            "SELECT * FROM skills ORDER BY name"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(skill_from_row).collect()
    }

    pub async fn get_skill(&self, name: &str) -> Result<Option<SkillRow>> {
        let row = sqlx::query("SELECT * FROM skills WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(|r| skill_from_row(&r)).transpose()
    }

    pub async fn delete_skill(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM skills WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_skill_active(&self, name: &str, is_active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE skills SET is_active = ? WHERE name = ?")
            .bind(is_active)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn active_skill_names(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT name FROM skills WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(db))
            .collect()
    }

    pub async fn set_role_skill_permission(
        &self,
        role_id: i64,
        skill_id: i64,
        can_use: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO role_skill_permissions (role_id, skill_id, can_use) VALUES (?, ?, ?) \
             ON CONFLICT (role_id, skill_id) DO UPDATE SET can_use = excluded.can_use",
        )
        .bind(role_id)
        .bind(skill_id)
        .bind(can_use)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    pub async fn set_department_skill_permission(
        &self,
        department_id: i64,
        skill_id: i64,
        is_allowed: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO department_skill_permissions (department_id, skill_id, is_allowed) \
             VALUES (?, ?, ?) \
             ON CONFLICT (department_id, skill_id) DO UPDATE SET is_allowed = excluded.is_allowed",
        )
        .bind(department_id)
        .bind(skill_id)
        .bind(is_allowed)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    pub async fn skill_names_for_roles(&self, role_ids: &[i64]) -> Result<HashSet<String>> {
        if role_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; role_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT s.name FROM skills s \
             JOIN role_skill_permissions p ON p.skill_id = s.id \
             WHERE p.role_id IN ({placeholders}) AND p.can_use = 1 AND s.is_active = 1"
        );
        let mut query = sqlx::query(&sql);
        for id in role_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(db))
            .collect()
    }

    pub async fn skill_names_blocked_for_department(
        &self,
        department_id: i64,
    ) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT s.name FROM skills s \
             JOIN department_skill_permissions p ON p.skill_id = s.id \
             WHERE p.department_id = ? AND p.is_allowed = 0",
        )
        .bind(department_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(db))
            .collect()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // MCP servers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn list_mcp_servers(&self, active_only: bool) -> Result<Vec<McpServerRow>> {
        let sql = if active_only {
            "SELECT * FROM mcp_servers WHERE is_active = 1 ORDER BY name"
        } else {
            "SELECT * FROM mcp_servers ORDER BY name"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(mcp_server_from_row).collect()
    }

    pub async fn get_mcp_server(&self, name: &str) -> Result<Option<McpServerRow>> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(|r| mcp_server_from_row(&r)).transpose()
    }

    pub async fn insert_mcp_server(
        &self,
        config: &McpServerConfig,
        is_active: bool,
    ) -> Result<i64> {
        config.validate()?;
        let args = serde_json::to_string(&config.args)?;
        let env = serde_json::to_string(&config.env)?;
        let id = sqlx::query(
            "INSERT INTO mcp_servers (name, transport, command, args, env, url, timeout_secs, is_active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.name)
        .bind(config.transport.to_string())
        .bind(&config.command)
        .bind(args)
        .bind(env)
        .bind(&config.url)
        .bind(config.timeout_secs as i64)
        .bind(is_active)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn update_mcp_server(
        &self,
        name: &str,
        config: &McpServerConfig,
        is_active: bool,
    ) -> Result<bool> {
        config.validate()?;
        let args = serde_json::to_string(&config.args)?;
        let env = serde_json::to_string(&config.env)?;
        let result = sqlx::query(
            "UPDATE mcp_servers SET name = ?, transport = ?, command = ?, args = ?, env = ?, \
             url = ?, timeout_secs = ?, is_active = ? WHERE name = ?",
        )
        .bind(&config.name)
        .bind(config.transport.to_string())
        .bind(&config.command)
        .bind(args)
        .bind(env)
        .bind(&config.url)
        .bind(config.timeout_secs as i64)
        .bind(is_active)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_mcp_server(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mcp_servers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // LLM model configs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn list_llm_models(&self) -> Result<Vec<LlmModelRow>> {
        let rows = sqlx::query("SELECT * FROM llm_models ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(llm_model_from_row).collect()
    }

    pub async fn get_llm_model(&self, name: &str) -> Result<Option<LlmModelRow>> {
        let row = sqlx::query("SELECT * FROM llm_models WHERE name = ? AND is_active = 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(|r| llm_model_from_row(&r)).transpose()
    }

    /// The configured default model, or any active model when none is
    /// flagged default.
    pub async fn default_llm_model(&self) -> Result<Option<LlmModelRow>> {
        let row = sqlx::query(
            "SELECT * FROM llm_models WHERE is_active = 1 \
             ORDER BY is_default DESC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(|r| llm_model_from_row(&r)).transpose()
    }

    /// The model used for background title generation: a `for_titles` row
    /// when present, otherwise the default model.
    pub async fn title_llm_model(&self) -> Result<Option<LlmModelRow>> {
        let row = sqlx::query(
            "SELECT * FROM llm_models WHERE is_active = 1 AND for_titles = 1 LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        match row {
            Some(r) => llm_model_from_row(&r).map(Some),
            None => self.default_llm_model().await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_llm_model(
        &self,
        name: &str,
        base_url: &str,
        api_key: &str,
        model_id: &str,
        is_default: bool,
        for_titles: bool,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO llm_models (name, base_url, api_key, model_id, is_default, for_titles) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(base_url)
        .bind(api_key)
        .bind(model_id)
        .bind(is_default)
        .bind(for_titles)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn delete_llm_model(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM llm_models WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let state_json: String = row.try_get("state").map_err(db)?;
    // A corrupt state blob should not make the conversation unreadable.
    let state = serde_json::from_str(&state_json).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unreadable conversation state, using default");
        ConversationState::default()
    });
    Ok(Conversation {
        id: row.try_get("id").map_err(db)?,
        owner_user_id: row.try_get("owner_user_id").map_err(db)?,
        title: row.try_get("title").map_err(db)?,
        created_at: row.try_get("created_at").map_err(db)?,
        updated_at: row.try_get("updated_at").map_err(db)?,
        archived: row.try_get("archived").map_err(db)?,
        starred: row.try_get("starred").map_err(db)?,
        state,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRow> {
    let role_str: String = row.try_get("role").map_err(db)?;
    let role = MessageRole::parse(&role_str)
        .ok_or_else(|| Error::Database(format!("unknown message role '{role_str}'")))?;
    let tool_calls_json: Option<String> = row.try_get("tool_calls").map_err(db)?;
    let tool_calls = tool_calls_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(MessageRow {
        id: row.try_get("id").map_err(db)?,
        conversation_id: row.try_get("conversation_id").map_err(db)?,
        step_order: row.try_get("step_order").map_err(db)?,
        role,
        content: row.try_get("content").map_err(db)?,
        tool_calls,
        tool_name: row.try_get("tool_name").map_err(db)?,
        tool_call_id: row.try_get("tool_call_id").map_err(db)?,
        tool_return_content: row.try_get("tool_return_content").map_err(db)?,
        created_at: row.try_get("created_at").map_err(db)?,
    })
}

fn skill_from_row(row: &SqliteRow) -> Result<SkillRow> {
    let tags_json: String = row.try_get("tags").map_err(db)?;
    Ok(SkillRow {
        id: row.try_get("id").map_err(db)?,
        name: row.try_get("name").map_err(db)?,
        version: row.try_get("version").map_err(db)?,
        description: row.try_get("description").map_err(db)?,
        path: row.try_get("path").map_err(db)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        is_active: row.try_get("is_active").map_err(db)?,
    })
}

fn mcp_server_from_row(row: &SqliteRow) -> Result<McpServerRow> {
    let transport_str: String = row.try_get("transport").map_err(db)?;
    let transport: McpTransportKind = transport_str
        .parse()
        .map_err(|_| Error::Database(format!("unknown MCP transport '{transport_str}'")))?;
    let args_json: String = row.try_get("args").map_err(db)?;
    let env_json: String = row.try_get("env").map_err(db)?;
    let timeout_secs: i64 = row.try_get("timeout_secs").map_err(db)?;
    Ok(McpServerRow {
        id: row.try_get("id").map_err(db)?,
        name: row.try_get("name").map_err(db)?,
        transport,
        command: row.try_get("command").map_err(db)?,
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        env: serde_json::from_str(&env_json).unwrap_or_default(),
        url: row.try_get("url").map_err(db)?,
        timeout_secs: timeout_secs.max(0) as u64,
        is_active: row.try_get("is_active").map_err(db)?,
    })
}

fn llm_model_from_row(row: &SqliteRow) -> Result<LlmModelRow> {
    Ok(LlmModelRow {
        id: row.try_get("id").map_err(db)?,
        name: row.try_get("name").map_err(db)?,
        base_url: row.try_get("base_url").map_err(db)?,
        api_key: row.try_get("api_key").map_err(db)?,
        model_id: row.try_get("model_id").map_err(db)?,
        is_default: row.try_get("is_default").map_err(db)?,
        for_titles: row.try_get("for_titles").map_err(db)?,
        is_active: row.try_get("is_active").map_err(db)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dg_domain::todo::{Todo, TodoStatus};
    use dg_domain::tool::ToolCall;

    #[tokio::test]
    async fn conversation_roundtrip() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let user = repo.insert_user("alice", false, None).await.unwrap();

        let conv = repo.create_conversation(user, None).await.unwrap();
        assert!(conv.needs_title());
        assert!(!conv.archived);
        assert!(conv.state.todos.is_empty());

        let listed = repo.list_conversations(user).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, conv.id);

        repo.set_archived(conv.id, true).await.unwrap();
        assert!(repo.list_conversations(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_roundtrip_preserves_todos() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let user = repo.insert_user("alice", false, None).await.unwrap();
        let conv = repo.create_conversation(user, None).await.unwrap();

        let state = ConversationState {
            todos: vec![Todo {
                content: "analyze data".into(),
                status: TodoStatus::InProgress,
                active_form: "Analyzing data".into(),
            }],
            uploads: Default::default(),
        };
        repo.save_state(conv.id, &state).await.unwrap();

        let back = repo.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(back.state.todos.len(), 1);
        assert_eq!(back.state.todos[0].status, TodoStatus::InProgress);
    }

    #[tokio::test]
    async fn title_written_once() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let user = repo.insert_user("alice", false, None).await.unwrap();
        let conv = repo.create_conversation(user, None).await.unwrap();

        assert!(repo.set_title_if_missing(conv.id, "数据分析").await.unwrap());
        // A second writer loses the race and skips.
        assert!(!repo.set_title_if_missing(conv.id, "别的标题").await.unwrap());

        let back = repo.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(back.title.as_deref(), Some("数据分析"));
    }

    #[tokio::test]
    async fn message_roundtrip_with_tool_calls() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let user = repo.insert_user("alice", false, None).await.unwrap();
        let conv = repo.create_conversation(user, None).await.unwrap();

        assert_eq!(repo.max_step_order(conv.id).await.unwrap(), 0);

        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "ls".into(),
            arguments: serde_json::json!({"path": "/workspace"}),
        }];
        repo.insert_message(&NewMessage::user(conv.id, 1, "list files"))
            .await
            .unwrap();
        repo.insert_message(&NewMessage::model_with_tool_calls(conv.id, 2, "", calls.clone()))
            .await
            .unwrap();
        repo.insert_message(&NewMessage::tool_return(conv.id, 3, "ls", "c1", "uploads/"))
            .await
            .unwrap();

        assert_eq!(repo.max_step_order(conv.id).await.unwrap(), 3);

        let rows = repo.list_messages(conv.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].role, MessageRole::User);
        assert_eq!(rows[1].tool_calls.as_ref().unwrap(), &calls);
        assert_eq!(rows[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(rows[2].tool_name.as_deref(), Some("ls"));
    }

    #[tokio::test]
    async fn duplicate_step_order_rejected() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let user = repo.insert_user("alice", false, None).await.unwrap();
        let conv = repo.create_conversation(user, None).await.unwrap();

        repo.insert_message(&NewMessage::user(conv.id, 1, "a")).await.unwrap();
        let dup = repo.insert_message(&NewMessage::user(conv.id, 1, "b")).await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn user_with_roles() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let dept = repo.insert_department("analytics").await.unwrap();
        let user = repo.insert_user("bob", false, Some(dept)).await.unwrap();
        let role = repo.insert_role("analyst").await.unwrap();
        repo.assign_role(user, role).await.unwrap();

        let loaded = repo.get_user(user).await.unwrap().unwrap();
        assert_eq!(loaded.username, "bob");
        assert_eq!(loaded.department_id, Some(dept));
        assert_eq!(loaded.role_ids, vec![role]);
        assert!(repo.get_user(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn role_grants_minus_department_blocks() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let dept = repo.insert_department("ops").await.unwrap();
        let role = repo.insert_role("operator").await.unwrap();

        let t_x = repo.insert_mcp_tool("tool_x", None, None).await.unwrap();
        let t_y = repo.insert_mcp_tool("tool_y", None, None).await.unwrap();
        repo.set_role_tool_permission(role, t_x, true).await.unwrap();
        repo.set_role_tool_permission(role, t_y, true).await.unwrap();
        repo.set_department_tool_permission(dept, t_y, false).await.unwrap();

        let granted = repo.tool_names_for_roles(&[role]).await.unwrap();
        assert_eq!(granted.len(), 2);
        let blocked = repo.tool_names_blocked_for_department(dept).await.unwrap();
        assert!(blocked.contains("tool_y"));
        assert_eq!(blocked.len(), 1);
    }

    #[tokio::test]
    async fn mcp_server_roundtrip() {
        let repo = Repository::connect_in_memory().await.unwrap();
        let config = McpServerConfig {
            name: "filesystem".into(),
            transport: McpTransportKind::Stdio,
            command: Some("npx".into()),
            args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into()],
            env: [("NODE_ENV".to_string(), "production".to_string())].into(),
            url: None,
            timeout_secs: 45,
        };
        repo.insert_mcp_server(&config, true).await.unwrap();

        let back = repo.get_mcp_server("filesystem").await.unwrap().unwrap();
        assert_eq!(back.to_config(), config);
        assert!(back.is_active);

        // Invalid config is rejected before touching the table.
        let bad = McpServerConfig {
            name: "broken".into(),
            transport: McpTransportKind::Http,
            command: None,
            args: vec![],
            env: Default::default(),
            url: None,
            timeout_secs: 30,
        };
        assert!(repo.insert_mcp_server(&bad, true).await.is_err());
    }

    #[tokio::test]
    async fn llm_model_selection() {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.insert_llm_model("main", "https://api.example.com/v1", "k", "gpt-4.1", true, false)
            .await
            .unwrap();
        repo.insert_llm_model("mini", "https://api.example.com/v1", "k", "gpt-4.1-mini", false, true)
            .await
            .unwrap();

        assert_eq!(repo.default_llm_model().await.unwrap().unwrap().name, "main");
        assert_eq!(repo.title_llm_model().await.unwrap().unwrap().name, "mini");

        assert!(repo.delete_llm_model("mini").await.unwrap());
        assert_eq!(repo.title_llm_model().await.unwrap().unwrap().name, "main");
    }

    #[tokio::test]
    async fn skill_rows_and_activation() {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.upsert_skill("data-report", "1.2.0", "Generate reports", "/data/skills/data-report", &["excel".into()])
            .await
            .unwrap();
        // Upsert with the same name refreshes rather than duplicating.
        repo.upsert_skill("data-report", "1.3.0", "Generate reports", "/data/skills/data-report", &[])
            .await
            .unwrap();

        let skills = repo.list_skills(false).await.unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].version, "1.3.0");

        assert!(repo.set_skill_active("data-report", false).await.unwrap());
        assert!(repo.active_skill_names().await.unwrap().is_empty());
    }
}
