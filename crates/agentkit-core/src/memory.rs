//! User Memories
//!
//! Facts about a user that outlive any one session, keyed by `user_id`.
//! The model maintains them itself through the `add_memory`,
//! `update_memory`, `delete_memory` and `clear_memories` tools, which run
//! through the registry and executor like any other tool.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::tool::{ParamType, ParameterSchema, Tool, ToolSchema};

/// One remembered fact
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMemory {
    pub memory_id: String,
    pub memory: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    /// User message the memory was drawn from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl UserMemory {
    pub fn new(memory: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            memory_id: Uuid::new_v4().to_string(),
            memory: memory.into(),
            topics,
            input: None,
            last_updated: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// Storage backend for user memories
pub trait MemoryStore: Send + Sync {
    /// Insert, or replace the memory with the same id
    fn upsert(&self, user_id: &str, memory: &UserMemory) -> Result<()>;

    fn get(&self, user_id: &str, memory_id: &str) -> Result<Option<UserMemory>>;

    /// Returns whether the memory existed
    fn delete(&self, user_id: &str, memory_id: &str) -> Result<bool>;

    /// Drop every memory of a user, returning how many there were
    fn clear(&self, user_id: &str) -> Result<usize>;

    /// A user's memories, oldest first
    fn list(&self, user_id: &str) -> Result<Vec<UserMemory>>;
}

/// In-memory memory store
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    users: RwLock<HashMap<String, Vec<UserMemory>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> AgentError {
    AgentError::Storage("memory store lock poisoned".into())
}

impl MemoryStore for InMemoryMemoryStore {
    fn upsert(&self, user_id: &str, memory: &UserMemory) -> Result<()> {
        let mut users = self.users.write().map_err(poisoned)?;
        let memories = users.entry(user_id.to_string()).or_default();
        match memories.iter_mut().find(|m| m.memory_id == memory.memory_id) {
            Some(existing) => *existing = memory.clone(),
            None => memories.push(memory.clone()),
        }
        Ok(())
    }

    fn get(&self, user_id: &str, memory_id: &str) -> Result<Option<UserMemory>> {
        let users = self.users.read().map_err(poisoned)?;
        Ok(users
            .get(user_id)
            .and_then(|ms| ms.iter().find(|m| m.memory_id == memory_id))
            .cloned())
    }

    fn delete(&self, user_id: &str, memory_id: &str) -> Result<bool> {
        let mut users = self.users.write().map_err(poisoned)?;
        let Some(memories) = users.get_mut(user_id) else {
            return Ok(false);
        };
        let before = memories.len();
        memories.retain(|m| m.memory_id != memory_id);
        Ok(memories.len() < before)
    }

    fn clear(&self, user_id: &str) -> Result<usize> {
        let mut users = self.users.write().map_err(poisoned)?;
        Ok(users.remove(user_id).map_or(0, |ms| ms.len()))
    }

    fn list(&self, user_id: &str) -> Result<Vec<UserMemory>> {
        let users = self.users.read().map_err(poisoned)?;
        Ok(users.get(user_id).cloned().unwrap_or_default())
    }
}

/// One user's view of a [`MemoryStore`]
#[derive(Clone)]
pub struct UserMemories {
    store: Arc<dyn MemoryStore>,
    user_id: String,
}

impl std::fmt::Debug for UserMemories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserMemories")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl UserMemories {
    pub fn new(store: Arc<dyn MemoryStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn add(&self, memory: UserMemory) -> Result<UserMemory> {
        self.store.upsert(&self.user_id, &memory)?;
        tracing::debug!(user_id = %self.user_id, memory_id = %memory.memory_id, "Memory added");
        Ok(memory)
    }

    /// Replace the text and topics of an existing memory
    pub fn update(&self, memory_id: &str, memory: impl Into<String>, topics: Vec<String>) -> Result<UserMemory> {
        let mut existing = self
            .store
            .get(&self.user_id, memory_id)?
            .ok_or_else(|| AgentError::Storage(format!("no memory with id `{memory_id}`")))?;
        existing.memory = memory.into();
        existing.topics = topics;
        existing.last_updated = Utc::now();
        self.store.upsert(&self.user_id, &existing)?;
        tracing::debug!(user_id = %self.user_id, memory_id, "Memory updated");
        Ok(existing)
    }

    pub fn delete(&self, memory_id: &str) -> Result<bool> {
        let deleted = self.store.delete(&self.user_id, memory_id)?;
        tracing::debug!(user_id = %self.user_id, memory_id, deleted, "Memory deleted");
        Ok(deleted)
    }

    pub fn clear(&self) -> Result<usize> {
        let cleared = self.store.clear(&self.user_id)?;
        tracing::debug!(user_id = %self.user_id, cleared, "Memories cleared");
        Ok(cleared)
    }

    pub fn list(&self) -> Result<Vec<UserMemory>> {
        self.store.list(&self.user_id)
    }

    /// The four memory tools, bound to this user
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(AddMemoryTool(self.clone())),
            Arc::new(UpdateMemoryTool(self.clone())),
            Arc::new(DeleteMemoryTool(self.clone())),
            Arc::new(ClearMemoriesTool(self.clone())),
        ]
    }
}

fn topics_param() -> ParameterSchema {
    ParameterSchema::optional(
        "topics",
        ParamType::Array,
        "Topics of the memory as strings (e.g., [\"personal\", \"preferences\"])",
    )
}

fn topics(arguments: &Value) -> anyhow::Result<Vec<String>> {
    match arguments.get("topics") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|t| {
                t.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("topics must be strings"))
            })
            .collect(),
        Some(_) => anyhow::bail!("topics must be an array"),
    }
}

fn text<'a>(arguments: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing {key}"))
}

/// `add_memory` tool
pub struct AddMemoryTool(pub UserMemories);

#[async_trait]
impl Tool for AddMemoryTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("add_memory", "Remember a fact about the user for future conversations")
            .param(ParameterSchema::required("memory", ParamType::String, "The fact to remember"))
            .param(topics_param())
            .param(ParameterSchema::optional(
                "input",
                ParamType::String,
                "The user message the fact came from",
            ))
    }

    async fn invoke(&self, arguments: &Value) -> anyhow::Result<Value> {
        let mut memory = UserMemory::new(text(arguments, "memory")?, topics(arguments)?);
        if let Some(input) = arguments.get("input").and_then(Value::as_str) {
            memory = memory.with_input(input);
        }
        let memory = self.0.add(memory)?;
        Ok(json!({ "memory_id": memory.memory_id }))
    }
}

/// `update_memory` tool
pub struct UpdateMemoryTool(pub UserMemories);

#[async_trait]
impl Tool for UpdateMemoryTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("update_memory", "Replace an existing memory about the user")
            .param(ParameterSchema::required("memory_id", ParamType::String, "Id of the memory to update"))
            .param(ParameterSchema::required("memory", ParamType::String, "The updated fact"))
            .param(topics_param())
    }

    async fn invoke(&self, arguments: &Value) -> anyhow::Result<Value> {
        let memory_id = text(arguments, "memory_id")?;
        let memory = self.0.update(memory_id, text(arguments, "memory")?, topics(arguments)?)?;
        Ok(json!({ "memory_id": memory.memory_id }))
    }
}

/// `delete_memory` tool
pub struct DeleteMemoryTool(pub UserMemories);

#[async_trait]
impl Tool for DeleteMemoryTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("delete_memory", "Forget a single memory about the user")
            .param(ParameterSchema::required("memory_id", ParamType::String, "Id of the memory to delete"))
    }

    async fn invoke(&self, arguments: &Value) -> anyhow::Result<Value> {
        let deleted = self.0.delete(text(arguments, "memory_id")?)?;
        Ok(json!({ "deleted": deleted }))
    }
}

/// `clear_memories` tool
pub struct ClearMemoriesTool(pub UserMemories);

#[async_trait]
impl Tool for ClearMemoriesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("clear_memories", "Forget everything remembered about the user")
    }

    async fn invoke(&self, _arguments: &Value) -> anyhow::Result<Value> {
        let cleared = self.0.clear()?;
        Ok(json!({ "cleared": cleared }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memories(user: &str, store: &Arc<InMemoryMemoryStore>) -> UserMemories {
        UserMemories::new(Arc::clone(store) as Arc<dyn MemoryStore>, user)
    }

    #[test]
    fn test_memories_are_isolated_per_user() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let alice = memories("alice", &store);
        let bob = memories("bob", &store);

        let fact = alice
            .add(UserMemory::new("Prefers metric units", vec!["preferences".into()]))
            .unwrap();
        bob.add(UserMemory::new("Lives in Oslo", Vec::new())).unwrap();

        assert_eq!(alice.list().unwrap(), vec![fact.clone()]);
        assert!(!bob.delete(&fact.memory_id).unwrap());
        assert_eq!(alice.list().unwrap().len(), 1);

        assert_eq!(bob.clear().unwrap(), 1);
        assert!(bob.list().unwrap().is_empty());
        assert_eq!(alice.list().unwrap().len(), 1);
    }

    #[test]
    fn test_update_keeps_id_and_refreshes_timestamp() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let alice = memories("alice", &store);
        let original = alice.add(UserMemory::new("Has a cat", Vec::new())).unwrap();

        let updated = alice.update(&original.memory_id, "Has two cats", vec!["pets".into()]).unwrap();
        assert_eq!(updated.memory_id, original.memory_id);
        assert!(updated.last_updated >= original.last_updated);
        assert_eq!(alice.list().unwrap(), vec![updated]);

        assert!(matches!(alice.update("missing", "x", Vec::new()), Err(AgentError::Storage(_))));
    }

    #[tokio::test]
    async fn test_tools_drive_the_store() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let alice = memories("alice", &store);

        let added = AddMemoryTool(alice.clone())
            .invoke(&json!({"memory": "Allergic to peanuts", "topics": ["health"], "input": "I can't eat peanuts"}))
            .await
            .unwrap();
        let id = added["memory_id"].as_str().unwrap().to_string();
        let stored = alice.list().unwrap();
        assert_eq!(stored[0].topics, vec!["health"]);
        assert_eq!(stored[0].input.as_deref(), Some("I can't eat peanuts"));

        UpdateMemoryTool(alice.clone())
            .invoke(&json!({"memory_id": id.as_str(), "memory": "Allergic to peanuts and cashews"}))
            .await
            .unwrap();
        assert_eq!(alice.list().unwrap()[0].memory, "Allergic to peanuts and cashews");

        let bad = AddMemoryTool(alice.clone())
            .invoke(&json!({"memory": "x", "topics": [1]}))
            .await;
        assert!(bad.is_err());

        let deleted = DeleteMemoryTool(alice.clone()).invoke(&json!({"memory_id": id})).await.unwrap();
        assert_eq!(deleted, json!({"deleted": true}));

        alice.add(UserMemory::new("a", Vec::new())).unwrap();
        alice.add(UserMemory::new("b", Vec::new())).unwrap();
        let cleared = ClearMemoriesTool(alice.clone()).invoke(&json!({})).await.unwrap();
        assert_eq!(cleared, json!({"cleared": 2}));
    }

    #[test]
    fn test_tool_names() {
        let alice = UserMemories::new(Arc::new(InMemoryMemoryStore::new()), "alice");
        let names: Vec<_> = alice.tools().iter().map(|t| t.schema().name).collect();
        assert_eq!(names, vec!["add_memory", "update_memory", "delete_memory", "clear_memories"]);
    }
}
