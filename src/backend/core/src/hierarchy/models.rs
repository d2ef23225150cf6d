//! Character hierarchy records and the resolved per-user context.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

use crate::error::{ErrorCode, KeystoneError};
use crate::models::{AllianceId, CharacterId, CorporationId, UserId};

/// One character owned by a user, as reported by the character directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub character_id: CharacterId,
    pub character_name: String,
    pub corporation_id: CorporationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<AllianceId>,
    #[serde(default)]
    pub is_primary: bool,
}

impl CharacterRecord {
    pub fn new(
        character_id: impl Into<CharacterId>,
        character_name: impl Into<String>,
        corporation_id: impl Into<CorporationId>,
    ) -> Self {
        Self {
            character_id: character_id.into(),
            character_name: character_name.into(),
            corporation_id: corporation_id.into(),
            alliance_id: None,
            is_primary: false,
        }
    }

    pub fn in_alliance(mut self, alliance_id: impl Into<AllianceId>) -> Self {
        self.alliance_id = Some(alliance_id.into());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

/// A persisted hierarchy row: a character record bound to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterHierarchy {
    pub user_id: UserId,
    #[serde(flatten)]
    pub character: CharacterRecord,
}

/// Why a user's hierarchy could not be resolved.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The directory (or the call to it) failed. Distinct from "no characters".
    #[error("character directory unavailable: {0}")]
    Unavailable(#[source] KeystoneError),

    /// Stored data violates the one-primary-per-user rule.
    #[error("hierarchy integrity violation for user {user_id}: {reason}")]
    Integrity { user_id: UserId, reason: String },
}

impl ResolutionError {
    pub fn is_subsystem_failure(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<ResolutionError> for KeystoneError {
    fn from(error: ResolutionError) -> Self {
        match error {
            ResolutionError::Unavailable(inner) if inner.is_subsystem_failure() => inner,
            ResolutionError::Unavailable(inner) => KeystoneError::with_internal(
                ErrorCode::DirectoryUnavailable,
                "The character directory is unavailable",
                inner.to_string(),
            )
            .with_source(inner),
            ResolutionError::Integrity { user_id, reason } => KeystoneError::with_internal(
                ErrorCode::IntegrityViolation,
                "Character hierarchy data is inconsistent",
                reason,
            )
            .with_context("user_id", user_id.as_str()),
        }
    }
}

/// Everything a user controls, resolved for authorization.
///
/// `characters` starts with the primary character; corporation and alliance
/// identifiers are deduplicated in that same encounter order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyContext {
    pub user_id: UserId,
    pub primary_character_id: Option<CharacterId>,
    pub characters: Vec<CharacterRecord>,
    pub corporation_ids: Vec<CorporationId>,
    pub alliance_ids: Vec<AllianceId>,
}

impl HierarchyContext {
    /// A valid context for a user with no characters.
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            primary_character_id: None,
            characters: Vec::new(),
            corporation_ids: Vec::new(),
            alliance_ids: Vec::new(),
        }
    }

    /// Build a context from directory records.
    ///
    /// Exactly one record should be flagged primary. When none is, the first
    /// record by name (then id) is chosen and a warning is logged. More than
    /// one flagged primary is an integrity fault.
    pub fn from_characters(user_id: UserId, records: Vec<CharacterRecord>) -> Result<Self, ResolutionError> {
        if records.is_empty() {
            return Ok(Self::empty(user_id));
        }

        let primaries = records.iter().filter(|c| c.is_primary).count();
        if primaries > 1 {
            return Err(ResolutionError::Integrity {
                user_id,
                reason: format!("{} characters are flagged primary", primaries),
            });
        }

        let primary_index = match records.iter().position(|c| c.is_primary) {
            Some(index) => index,
            None => {
                let (index, chosen) = records
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        a.character_name
                            .cmp(&b.character_name)
                            .then_with(|| a.character_id.cmp(&b.character_id))
                    })
                    .map(|(i, c)| (i, c.character_id.clone()))
                    .unwrap_or((0, records[0].character_id.clone()));
                warn!(
                    user_id = %user_id,
                    character_id = %chosen,
                    "No primary character flagged; selected first by name"
                );
                index
            }
        };

        let mut characters = records;
        let mut primary = characters.remove(primary_index);
        primary.is_primary = true;
        characters.insert(0, primary);

        let mut seen_characters = HashSet::new();
        characters.retain(|c| seen_characters.insert(c.character_id.clone()));

        let mut corporation_ids = Vec::new();
        let mut alliance_ids = Vec::new();
        for character in &characters {
            if !corporation_ids.contains(&character.corporation_id) {
                corporation_ids.push(character.corporation_id.clone());
            }
            if let Some(alliance) = &character.alliance_id {
                if !alliance_ids.contains(alliance) {
                    alliance_ids.push(alliance.clone());
                }
            }
        }

        Ok(Self {
            user_id,
            primary_character_id: Some(characters[0].character_id.clone()),
            characters,
            corporation_ids,
            alliance_ids,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn primary(&self) -> Option<&CharacterRecord> {
        self.primary_character_id
            .as_ref()
            .and_then(|id| self.characters.iter().find(|c| &c.character_id == id))
    }

    pub fn character_ids(&self) -> Vec<CharacterId> {
        self.characters.iter().map(|c| c.character_id.clone()).collect()
    }

    pub fn corporation_ids(&self) -> &[CorporationId] {
        &self.corporation_ids
    }

    pub fn alliance_ids(&self) -> &[AllianceId] {
        &self.alliance_ids
    }

    pub fn owns_character(&self, character_id: &CharacterId) -> bool {
        self.characters.iter().any(|c| &c.character_id == character_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("u1")
    }

    #[test]
    fn test_empty_directory_is_valid() {
        let ctx = HierarchyContext::from_characters(user(), vec![]).unwrap();
        assert!(ctx.is_empty());
        assert!(ctx.primary().is_none());
    }

    #[test]
    fn test_primary_first_and_dedup() {
        let ctx = HierarchyContext::from_characters(
            user(),
            vec![
                CharacterRecord::new("c2", "Beta", "corp1").in_alliance("a1"),
                CharacterRecord::new("c1", "Alpha", "corp2").in_alliance("a2").primary(),
                CharacterRecord::new("c3", "Gamma", "corp1").in_alliance("a1"),
            ],
        )
        .unwrap();

        assert_eq!(ctx.primary_character_id, Some(CharacterId::new("c1")));
        assert_eq!(
            ctx.character_ids(),
            vec![CharacterId::new("c1"), CharacterId::new("c2"), CharacterId::new("c3")]
        );
        assert_eq!(ctx.corporation_ids(), &[CorporationId::new("corp2"), CorporationId::new("corp1")]);
        assert_eq!(ctx.alliance_ids(), &[AllianceId::new("a2"), AllianceId::new("a1")]);
    }

    #[test]
    fn test_missing_primary_picks_first_by_name() {
        let ctx = HierarchyContext::from_characters(
            user(),
            vec![
                CharacterRecord::new("c9", "Zed", "corp1"),
                CharacterRecord::new("c5", "Amy", "corp1"),
                CharacterRecord::new("c4", "Amy", "corp1"),
            ],
        )
        .unwrap();

        assert_eq!(ctx.primary_character_id, Some(CharacterId::new("c4")));
        assert!(ctx.primary().unwrap().is_primary);
    }

    #[test]
    fn test_multiple_primaries_is_integrity_fault() {
        let err = HierarchyContext::from_characters(
            user(),
            vec![
                CharacterRecord::new("c1", "A", "corp1").primary(),
                CharacterRecord::new("c2", "B", "corp1").primary(),
            ],
        )
        .unwrap_err();

        assert!(matches!(err, ResolutionError::Integrity { .. }));
        assert!(!err.is_subsystem_failure());
        assert_eq!(KeystoneError::from(err).code(), ErrorCode::IntegrityViolation);
    }
}
