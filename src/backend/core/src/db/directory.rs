//! `character_hierarchy` table.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Result;
use crate::hierarchy::{CharacterDirectory, CharacterRecord};
use crate::models::{AllianceId, CharacterId, CorporationId, UserId};

#[derive(Clone)]
pub struct PgCharacterDirectory {
    pool: PgPool,
}

impl PgCharacterDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CharacterRow {
    character_id: String,
    character_name: String,
    corporation_id: String,
    alliance_id: Option<String>,
    is_primary: bool,
}

impl From<CharacterRow> for CharacterRecord {
    fn from(row: CharacterRow) -> Self {
        Self {
            character_id: CharacterId::from(row.character_id),
            character_name: row.character_name,
            corporation_id: CorporationId::from(row.corporation_id),
            alliance_id: row.alliance_id.map(AllianceId::from),
            is_primary: row.is_primary,
        }
    }
}

#[async_trait]
impl CharacterDirectory for PgCharacterDirectory {
    async fn characters_for_user(&self, user_id: &UserId) -> Result<Vec<CharacterRecord>> {
        let rows = sqlx::query_as::<_, CharacterRow>(
            r#"
            SELECT character_id, character_name, corporation_id, alliance_id, is_primary
            FROM character_hierarchy
            WHERE user_id = $1
            ORDER BY is_primary DESC, character_id
            "#,
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CharacterRecord::from).collect())
    }

    async fn replace_characters(&self, user_id: &UserId, characters: &[CharacterRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM character_hierarchy WHERE user_id = $1")
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await?;

        for character in characters {
            // A character transferred from another user moves with its row.
            sqlx::query(
                r#"
                INSERT INTO character_hierarchy
                    (character_id, user_id, character_name, corporation_id, alliance_id, is_primary, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (character_id) DO UPDATE SET
                    user_id = EXCLUDED.user_id,
                    character_name = EXCLUDED.character_name,
                    corporation_id = EXCLUDED.corporation_id,
                    alliance_id = EXCLUDED.alliance_id,
                    is_primary = EXCLUDED.is_primary,
                    updated_at = NOW()
                "#,
            )
            .bind(character.character_id.as_str())
            .bind(user_id.as_str())
            .bind(&character.character_name)
            .bind(character.corporation_id.as_str())
            .bind(character.alliance_id.as_ref().map(|a| a.as_str()))
            .bind(character.is_primary)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
