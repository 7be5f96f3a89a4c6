//! Append-only, id-deduplicated message log.

use std::collections::HashMap;

use crate::types::Message;

#[derive(Debug, Default, Clone)]
pub struct Timeline {
    messages: Vec<Message>,
    /// id -> position in `messages`
    index: HashMap<String, usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message unless its id is already present.
    /// Returns `true` if the message was appended.
    pub fn append(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.messages[i])
    }

    /// Record a fork on an existing message. Returns `false` if the message
    /// is unknown or already lists the branch.
    pub fn mark_branch(&mut self, message_id: &str, branch_id: &str) -> bool {
        let Some(&i) = self.index.get(message_id) else {
            return false;
        };
        let branches = &mut self.messages[i].branches;
        if branches.iter().any(|b| b == branch_id) {
            return false;
        }
        branches.push(branch_id.to_string());
        true
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
