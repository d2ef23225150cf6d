//! Authorization subjects and the fixed-priority subject list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{KeystoneError, Result};
use crate::hierarchy::HierarchyContext;
use crate::models::UserId;

/// The kind of identity a policy or role is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    User,
    Character,
    Corporation,
    Alliance,
    Role,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Character => "character",
            Self::Corporation => "corporation",
            Self::Alliance => "alliance",
            Self::Role => "role",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectType {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "character" => Ok(Self::Character),
            "corporation" => Ok(Self::Corporation),
            "alliance" => Ok(Self::Alliance),
            "role" => Ok(Self::Role),
            other => Err(KeystoneError::validation(format!("Unknown subject type: {}", other))),
        }
    }
}

/// A typed identity that can hold permissions, rendered as `type:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub subject_type: SubjectType,
    pub id: String,
}

impl Subject {
    pub fn new(subject_type: SubjectType, id: impl Into<String>) -> Self {
        Self {
            subject_type,
            id: id.into(),
        }
    }

    pub fn user(id: impl fmt::Display) -> Self {
        Self::new(SubjectType::User, id.to_string())
    }

    pub fn character(id: impl fmt::Display) -> Self {
        Self::new(SubjectType::Character, id.to_string())
    }

    pub fn corporation(id: impl fmt::Display) -> Self {
        Self::new(SubjectType::Corporation, id.to_string())
    }

    pub fn alliance(id: impl fmt::Display) -> Self {
        Self::new(SubjectType::Alliance, id.to_string())
    }

    pub fn role(name: impl fmt::Display) -> Self {
        Self::new(SubjectType::Role, name.to_string())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.id)
    }
}

impl FromStr for Subject {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| KeystoneError::validation(format!("Subject must be type:id, got {}", s)))?;
        if id.is_empty() {
            return Err(KeystoneError::validation("Subject id must not be empty"));
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

/// Subjects for a resolved hierarchy, in evaluation priority order:
/// user, primary character, other characters, corporations, alliances.
pub fn build_subjects(context: &HierarchyContext) -> Vec<Subject> {
    let mut subjects = Vec::with_capacity(
        1 + context.characters.len() + context.corporation_ids.len() + context.alliance_ids.len(),
    );

    subjects.push(Subject::user(&context.user_id));

    if let Some(primary) = &context.primary_character_id {
        subjects.push(Subject::character(primary));
    }
    subjects.extend(
        context
            .characters
            .iter()
            .filter(|c| Some(&c.character_id) != context.primary_character_id.as_ref())
            .map(|c| Subject::character(&c.character_id)),
    );
    subjects.extend(context.corporation_ids.iter().map(Subject::corporation));
    subjects.extend(context.alliance_ids.iter().map(Subject::alliance));

    subjects
}

/// Append role subjects after the hierarchy subjects, skipping duplicates.
pub fn append_roles(subjects: &mut Vec<Subject>, roles: impl IntoIterator<Item = String>) {
    for role in roles {
        let subject = Subject::role(role);
        if !subjects.contains(&subject) {
            subjects.push(subject);
        }
    }
}

/// The user subject of a user id.
pub fn user_subject(user_id: &UserId) -> Subject {
    Subject::user(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::CharacterRecord;

    #[test]
    fn test_subject_priority_order() {
        let ctx = HierarchyContext::from_characters(
            UserId::new("U"),
            vec![
                CharacterRecord::new("C2", "Beta", "CORP2").in_alliance("ALL1"),
                CharacterRecord::new("C1", "Alpha", "CORP1").primary(),
            ],
        )
        .unwrap();

        let rendered: Vec<String> = build_subjects(&ctx).iter().map(|s| s.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "user:U",
                "character:C1",
                "character:C2",
                "corporation:CORP1",
                "corporation:CORP2",
                "alliance:ALL1",
            ]
        );
    }

    #[test]
    fn test_empty_hierarchy_yields_user_only() {
        let subjects = build_subjects(&HierarchyContext::empty(UserId::new("U")));
        assert_eq!(subjects, vec![Subject::user("U")]);
    }

    #[test]
    fn test_build_is_idempotent() {
        let ctx = HierarchyContext::from_characters(
            UserId::new("U"),
            vec![CharacterRecord::new("C1", "A", "CORP1").primary()],
        )
        .unwrap();
        assert_eq!(build_subjects(&ctx), build_subjects(&ctx));
    }

    #[test]
    fn test_append_roles_dedup() {
        let mut subjects = vec![Subject::user("U")];
        append_roles(&mut subjects, vec!["admin".to_string(), "admin".to_string(), "viewer".to_string()]);
        assert_eq!(subjects.len(), 3);
        assert_eq!(subjects[1], Subject::role("admin"));
    }

    #[test]
    fn test_parse_subject() {
        let subject: Subject = "corporation:98000001".parse().unwrap();
        assert_eq!(subject, Subject::corporation("98000001"));
        assert!("bogus:1".parse::<Subject>().is_err());
        assert!("user:".parse::<Subject>().is_err());
        assert!("user".parse::<Subject>().is_err());
    }
}
