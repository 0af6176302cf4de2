//! Who may see or change what. Admins pass every check; everyone else is
//! scoped by project membership.

use db::models::{
    project_member::{MemberRole, ProjectMember},
    user::User,
};
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn can_view_project(
    pool: &SqlitePool,
    user: &User,
    project_id: Uuid,
) -> Result<bool, sqlx::Error> {
    if user.is_admin() {
        return Ok(true);
    }
    Ok(ProjectMember::find(pool, project_id, user.id).await?.is_some())
}

pub async fn can_edit_project(
    pool: &SqlitePool,
    user: &User,
    project_id: Uuid,
) -> Result<bool, sqlx::Error> {
    if user.is_admin() {
        return Ok(true);
    }
    Ok(ProjectMember::find(pool, project_id, user.id)
        .await?
        .is_some_and(|m| m.role == MemberRole::Admin))
}

pub async fn can_view_sites(
    pool: &SqlitePool,
    user: &User,
    opportunity_id: &str,
) -> Result<bool, sqlx::Error> {
    if user.is_admin() {
        return Ok(true);
    }
    Ok(ProjectMember::find_by_opportunity(pool, opportunity_id, user.id)
        .await?
        .is_some())
}

pub async fn can_edit_site(
    pool: &SqlitePool,
    user: &User,
    opportunity_id: &str,
) -> Result<bool, sqlx::Error> {
    if user.is_admin() {
        return Ok(true);
    }
    Ok(ProjectMember::find_by_opportunity(pool, opportunity_id, user.id)
        .await?
        .is_some_and(|m| m.role.can_edit_sites()))
}

#[cfg(test)]
mod tests {
    use db::{
        DBService,
        models::{
            project::{CreateProject, Project},
            project_member::AddProjectMember,
            user::{CreateUser, UserRole},
        },
    };

    use super::*;

    async fn user(db: &DBService, phone: &str, role: UserRole) -> User {
        User::create(
            &db.pool,
            &CreateUser {
                phone: phone.to_string(),
                name: phone.to_string(),
                email: None,
                global_role: Some(role),
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn membership_scopes_non_admins() {
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

        let admin = user(&db, "0911000001", UserRole::Admin).await;
        let owner = user(&db, "0911000002", UserRole::Owner).await;
        let foreman = user(&db, "0911000003", UserRole::Foreman).await;
        let outsider = user(&db, "0911000004", UserRole::Worker).await;

        for (member, role) in [(&owner, MemberRole::Owner), (&foreman, MemberRole::Foreman)] {
            ProjectMember::upsert(
                &db.pool,
                project.id,
                &AddProjectMember {
                    user_id: member.id,
                    role: Some(role),
                    team_id: None,
                },
            )
            .await
            .unwrap();
        }

        assert!(can_edit_site(&db.pool, &admin, "opp-1").await.unwrap());
        assert!(can_edit_site(&db.pool, &foreman, "opp-1").await.unwrap());
        assert!(!can_edit_site(&db.pool, &owner, "opp-1").await.unwrap());
        assert!(can_view_sites(&db.pool, &owner, "opp-1").await.unwrap());
        assert!(!can_view_sites(&db.pool, &outsider, "opp-1").await.unwrap());

        assert!(can_view_project(&db.pool, &foreman, project.id).await.unwrap());
        assert!(!can_view_project(&db.pool, &outsider, project.id).await.unwrap());
        assert!(!can_edit_project(&db.pool, &foreman, project.id).await.unwrap());
        assert!(can_edit_project(&db.pool, &admin, project.id).await.unwrap());
    }
}
