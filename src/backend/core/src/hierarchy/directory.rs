//! Character directory collaborator.

use async_trait::async_trait;
use dashmap::DashMap;

use super::models::CharacterRecord;
use crate::error::Result;
use crate::models::UserId;

/// Source of truth for which characters a user owns.
#[async_trait]
pub trait CharacterDirectory: Send + Sync {
    /// All characters owned by `user_id`, in storage order.
    async fn characters_for_user(&self, user_id: &UserId) -> Result<Vec<CharacterRecord>>;

    /// Replace every character row for `user_id` in one atomic step.
    async fn replace_characters(&self, user_id: &UserId, characters: &[CharacterRecord]) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Process-local directory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    characters: DashMap<UserId, Vec<CharacterRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CharacterDirectory for InMemoryDirectory {
    async fn characters_for_user(&self, user_id: &UserId) -> Result<Vec<CharacterRecord>> {
        Ok(self
            .characters
            .get(user_id)
            .map(|c| c.value().clone())
            .unwrap_or_default())
    }

    async fn replace_characters(&self, user_id: &UserId, characters: &[CharacterRecord]) -> Result<()> {
        if characters.is_empty() {
            self.characters.remove(user_id);
        } else {
            self.characters.insert(user_id.clone(), characters.to_vec());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replace_is_wholesale() {
        let directory = InMemoryDirectory::new();
        let user = UserId::new("u1");

        directory
            .replace_characters(&user, &[CharacterRecord::new("c1", "A", "corp1"), CharacterRecord::new("c2", "B", "corp1")])
            .await
            .unwrap();
        directory
            .replace_characters(&user, &[CharacterRecord::new("c3", "C", "corp2")])
            .await
            .unwrap();

        let characters = directory.characters_for_user(&user).await.unwrap();
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].character_id.as_str(), "c3");
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_characters() {
        let directory = InMemoryDirectory::new();
        assert!(directory.characters_for_user(&UserId::new("nobody")).await.unwrap().is_empty());
    }
}
