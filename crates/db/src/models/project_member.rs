use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

/// Role a user holds inside one project.
#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "member_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Owner,
    Foreman,
    #[default]
    Worker,
}

impl MemberRole {
    /// Foremen and workers record progress on sites.
    pub fn can_edit_sites(self) -> bool {
        matches!(self, Self::Admin | Self::Foreman | Self::Worker)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ProjectMember {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub team_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Member row joined with the user's display fields.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ProjectMemberWithUser {
    pub user_id: Uuid,
    pub name: String,
    pub phone: String,
    pub role: MemberRole,
    pub team_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct AddProjectMember {
    pub user_id: Uuid,
    pub role: Option<MemberRole>,
    pub team_id: Option<String>,
}

impl ProjectMember {
    pub async fn find(
        pool: &SqlitePool,
        project_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ProjectMember>(
            r#"SELECT id, project_id, user_id, role, team_id, joined_at
               FROM project_members
               WHERE project_id = $1 AND user_id = $2"#,
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    /// Membership lookup for a site's project, resolved through the
    /// opportunity id.
    pub async fn find_by_opportunity(
        pool: &SqlitePool,
        opportunity_id: &str,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ProjectMember>(
            r#"SELECT m.id, m.project_id, m.user_id, m.role, m.team_id, m.joined_at
               FROM project_members m
               JOIN projects p ON p.id = m.project_id
               WHERE p.opportunity_id = $1 AND m.user_id = $2"#,
        )
        .bind(opportunity_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_for_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<ProjectMemberWithUser>, sqlx::Error> {
        sqlx::query_as::<_, ProjectMemberWithUser>(
            r#"SELECT m.user_id, u.name, u.phone, m.role, m.team_id, m.joined_at
               FROM project_members m
               JOIN users u ON u.id = m.user_id
               WHERE m.project_id = $1
               ORDER BY m.joined_at ASC"#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    /// Adds the user to the project, or changes their role if already a member.
    pub async fn upsert(
        pool: &SqlitePool,
        project_id: Uuid,
        data: &AddProjectMember,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, ProjectMember>(
            r#"INSERT INTO project_members (id, project_id, user_id, role, team_id)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT(project_id, user_id) DO UPDATE SET
                   role = excluded.role,
                   team_id = COALESCE(excluded.team_id, project_members.team_id)
               RETURNING id, project_id, user_id, role, team_id, joined_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(data.user_id)
        .bind(data.role.unwrap_or_default())
        .bind(&data.team_id)
        .fetch_one(pool)
        .await
    }

    pub async fn remove(
        pool: &SqlitePool,
        project_id: Uuid,
        user_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM project_members WHERE project_id = $1 AND user_id = $2")
                .bind(project_id)
                .bind(user_id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DBService,
        models::{
            project::{CreateProject, Project},
            user::{CreateUser, User},
        },
    };

    #[tokio::test]
    async fn upsert_changes_role_in_place() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = Project::create(
            &db.pool,
            &CreateProject {
                opportunity_id: "opp-1".to_string(),
                name: "工地".to_string(),
                spc_engineering: None,
                cabinet_engineering: None,
                permissions: None,
            },
            Uuid::new_v4(),
            None,
        )
        .await
        .unwrap();
        let user = User::create(
            &db.pool,
            &CreateUser {
                phone: "0911222333".to_string(),
                name: "李師傅".to_string(),
                email: None,
                global_role: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        let add = AddProjectMember {
            user_id: user.id,
            role: Some(MemberRole::Worker),
            team_id: Some("team-7".to_string()),
        };
        ProjectMember::upsert(&db.pool, project.id, &add).await.unwrap();
        let promoted = ProjectMember::upsert(
            &db.pool,
            project.id,
            &AddProjectMember {
                role: Some(MemberRole::Foreman),
                team_id: None,
                ..add
            },
        )
        .await
        .unwrap();

        assert_eq!(promoted.role, MemberRole::Foreman);
        assert_eq!(promoted.team_id.as_deref(), Some("team-7"));

        let members = ProjectMember::find_for_project(&db.pool, project.id).await.unwrap();
        assert_eq!(members.len(), 1);

        let via_opportunity = ProjectMember::find_by_opportunity(&db.pool, "opp-1", user.id)
            .await
            .unwrap();
        assert!(via_opportunity.is_some());

        assert_eq!(ProjectMember::remove(&db.pool, project.id, user.id).await.unwrap(), 1);
    }
}
