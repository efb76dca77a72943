//! Membership repository (组织与群组数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{MemberInsert, MembershipRepository};
use crate::{
    error::Result,
    models::{
        group::{Group, GroupMember, GroupRole},
        organization::{Organization, OrganizationMember, OrganizationRole},
        within_cap, Page,
    },
};

pub struct PgMembershipRepository {
    db: PgPool,
}

impl PgMembershipRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MembershipRepository for PgMembershipRepository {
    // ==================== Organizations ====================

    async fn insert_organization(&self, org: &Organization, owner: &OrganizationMember) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO organizations (
                id, name, display_name, description, owner_user_id, subscription_plan_id,
                is_personal, max_groups, max_members, is_active, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(&org.display_name)
        .bind(&org.description)
        .bind(&org.owner_user_id)
        .bind(org.subscription_plan_id)
        .bind(org.is_personal)
        .bind(org.max_groups)
        .bind(org.max_members)
        .bind(org.is_active)
        .bind(&org.metadata)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_org_member_row(&mut tx, owner).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(
            "SELECT * FROM organizations WHERE id = $1 AND is_active = TRUE",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(org)
    }

    async fn find_personal_organization(&self, user_id: &str) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(
            r#"
            SELECT * FROM organizations
            WHERE owner_user_id = $1 AND is_personal = TRUE AND is_active = TRUE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(org)
    }

    async fn find_organization_by_name(&self, owner_user_id: &str, name: &str) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(
            r#"
            SELECT * FROM organizations
            WHERE owner_user_id = $1 AND name = $2 AND is_active = TRUE
            "#,
        )
        .bind(owner_user_id)
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(org)
    }

    async fn list_user_organizations(&self, user_id: &str) -> Result<Vec<Organization>> {
        let orgs = sqlx::query_as::<_, Organization>(
            r#"
            SELECT o.*
            FROM organizations o
            JOIN organization_members m ON m.organization_id = o.id
            WHERE m.user_id = $1 AND m.is_active = TRUE AND o.is_active = TRUE
            ORDER BY o.created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(orgs)
    }

    async fn update_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE organizations
            SET display_name = $2, description = $3, max_groups = $4, max_members = $5,
                metadata = $6, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org.id)
        .bind(&org.display_name)
        .bind(&org.description)
        .bind(org.max_groups)
        .bind(org.max_members)
        .bind(&org.metadata)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn set_organization_plan(&self, id: Uuid, plan_id: Option<Uuid>) -> Result<()> {
        sqlx::query(
            "UPDATE organizations SET subscription_plan_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(plan_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn soft_delete_organization(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE organizations SET is_active = FALSE, updated_at = NOW() WHERE id = $1 AND is_active = TRUE",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_org_member(&self, org_id: Uuid, user_id: &str) -> Result<Option<OrganizationMember>> {
        let member = sqlx::query_as::<_, OrganizationMember>(
            r#"
            SELECT * FROM organization_members
            WHERE organization_id = $1 AND user_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(member)
    }

    async fn list_org_members(&self, org_id: Uuid, page: Page) -> Result<Vec<OrganizationMember>> {
        let members = sqlx::query_as::<_, OrganizationMember>(
            r#"
            SELECT * FROM organization_members
            WHERE organization_id = $1 AND is_active = TRUE
            ORDER BY joined_at, user_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(org_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.db)
        .await?;

        Ok(members)
    }

    async fn count_org_members(&self, org_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM organization_members WHERE organization_id = $1 AND is_active = TRUE",
        )
        .bind(org_id)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    async fn insert_org_member(
        &self,
        member: &OrganizationMember,
        max_members: i32,
    ) -> Result<MemberInsert<OrganizationMember>> {
        let mut tx = self.db.begin().await?;

        // 锁住组织行，串行化同一组织的成员写入
        sqlx::query("SELECT id FROM organizations WHERE id = $1 FOR UPDATE")
            .bind(member.organization_id)
            .execute(&mut *tx)
            .await?;

        let existing: Option<bool> = sqlx::query_scalar(
            "SELECT is_active FROM organization_members WHERE organization_id = $1 AND user_id = $2",
        )
        .bind(member.organization_id)
        .bind(&member.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing == Some(true) {
            return Ok(MemberInsert::AlreadyMember);
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM organization_members WHERE organization_id = $1 AND is_active = TRUE",
        )
        .bind(member.organization_id)
        .fetch_one(&mut *tx)
        .await?;
        if !within_cap(max_members, count) {
            return Ok(MemberInsert::CapacityReached);
        }

        let inserted = insert_org_member_row(&mut tx, member).await?;
        tx.commit().await?;
        Ok(MemberInsert::Inserted(inserted))
    }

    async fn update_org_member_role(&self, org_id: Uuid, user_id: &str, role: OrganizationRole) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE organization_members SET role = $3, updated_at = NOW()
            WHERE organization_id = $1 AND user_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(role)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_org_member(&self, org_id: Uuid, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE organization_members SET is_active = FALSE, updated_at = NOW()
            WHERE organization_id = $1 AND user_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ==================== Groups ====================

    async fn insert_group(&self, group: &Group, owner: &GroupMember) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO groups (
                id, name, display_name, description, owner_user_id, organization_id,
                parent_group_id, max_members, expires_at, is_active, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(&group.display_name)
        .bind(&group.description)
        .bind(&group.owner_user_id)
        .bind(group.organization_id)
        .bind(group.parent_group_id)
        .bind(group.max_members)
        .bind(group.expires_at)
        .bind(group.is_active)
        .bind(&group.metadata)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_group_member_row(&mut tx, owner).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        let group = sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE id = $1 AND is_active = TRUE")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(group)
    }

    async fn find_group_by_name(&self, owner_user_id: &str, name: &str) -> Result<Option<Group>> {
        let group = sqlx::query_as::<_, Group>(
            "SELECT * FROM groups WHERE owner_user_id = $1 AND name = $2 AND is_active = TRUE",
        )
        .bind(owner_user_id)
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(group)
    }

    async fn list_user_groups(&self, user_id: &str) -> Result<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(
            r#"
            SELECT g.*
            FROM groups g
            JOIN group_members m ON m.group_id = g.id
            WHERE m.user_id = $1 AND m.is_active = TRUE AND g.is_active = TRUE
            ORDER BY g.created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(groups)
    }

    async fn list_org_groups(&self, org_id: Uuid) -> Result<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(
            "SELECT * FROM groups WHERE organization_id = $1 AND is_active = TRUE ORDER BY created_at",
        )
        .bind(org_id)
        .fetch_all(&self.db)
        .await?;

        Ok(groups)
    }

    async fn count_org_groups(&self, org_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM groups WHERE organization_id = $1 AND is_active = TRUE",
        )
        .bind(org_id)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE groups
            SET display_name = $2, description = $3, max_members = $4, expires_at = $5,
                parent_group_id = $6, metadata = $7, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(group.id)
        .bind(&group.display_name)
        .bind(&group.description)
        .bind(group.max_members)
        .bind(group.expires_at)
        .bind(group.parent_group_id)
        .bind(&group.metadata)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn soft_delete_group(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE groups SET is_active = FALSE, updated_at = NOW() WHERE id = $1 AND is_active = TRUE",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_group_member(&self, group_id: Uuid, user_id: &str) -> Result<Option<GroupMember>> {
        let member = sqlx::query_as::<_, GroupMember>(
            "SELECT * FROM group_members WHERE group_id = $1 AND user_id = $2 AND is_active = TRUE",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(member)
    }

    async fn list_group_members(&self, group_id: Uuid, page: Page) -> Result<Vec<GroupMember>> {
        let members = sqlx::query_as::<_, GroupMember>(
            r#"
            SELECT * FROM group_members
            WHERE group_id = $1 AND is_active = TRUE
            ORDER BY joined_at, user_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(group_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.db)
        .await?;

        Ok(members)
    }

    async fn insert_group_member(
        &self,
        member: &GroupMember,
        max_members: i32,
    ) -> Result<MemberInsert<GroupMember>> {
        let mut tx = self.db.begin().await?;

        sqlx::query("SELECT id FROM groups WHERE id = $1 FOR UPDATE")
            .bind(member.group_id)
            .execute(&mut *tx)
            .await?;

        let existing: Option<bool> = sqlx::query_scalar(
            "SELECT is_active FROM group_members WHERE group_id = $1 AND user_id = $2",
        )
        .bind(member.group_id)
        .bind(&member.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing == Some(true) {
            return Ok(MemberInsert::AlreadyMember);
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND is_active = TRUE",
        )
        .bind(member.group_id)
        .fetch_one(&mut *tx)
        .await?;
        if !within_cap(max_members, count) {
            return Ok(MemberInsert::CapacityReached);
        }

        let inserted = insert_group_member_row(&mut tx, member).await?;
        tx.commit().await?;
        Ok(MemberInsert::Inserted(inserted))
    }

    async fn update_group_member_role(&self, group_id: Uuid, user_id: &str, role: GroupRole) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE group_members SET role = $3, updated_at = NOW()
            WHERE group_id = $1 AND user_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .bind(role)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_group_member(&self, group_id: Uuid, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE group_members SET is_active = FALSE, updated_at = NOW()
            WHERE group_id = $1 AND user_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// 插入或重新激活成员行（离开后再次加入复用同一行）
async fn insert_org_member_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    member: &OrganizationMember,
) -> Result<OrganizationMember> {
    let row = sqlx::query_as::<_, OrganizationMember>(
        r#"
        INSERT INTO organization_members (
            id, organization_id, user_id, role, joined_at, invited_by, is_active, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8)
        ON CONFLICT (organization_id, user_id) DO UPDATE SET
            role = EXCLUDED.role,
            joined_at = EXCLUDED.joined_at,
            invited_by = EXCLUDED.invited_by,
            is_active = TRUE,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(member.id)
    .bind(member.organization_id)
    .bind(&member.user_id)
    .bind(member.role)
    .bind(member.joined_at)
    .bind(&member.invited_by)
    .bind(member.created_at)
    .bind(member.updated_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row)
}

async fn insert_group_member_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    member: &GroupMember,
) -> Result<GroupMember> {
    let row = sqlx::query_as::<_, GroupMember>(
        r#"
        INSERT INTO group_members (
            id, group_id, user_id, role, joined_at, invited_by, is_active, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8)
        ON CONFLICT (group_id, user_id) DO UPDATE SET
            role = EXCLUDED.role,
            joined_at = EXCLUDED.joined_at,
            invited_by = EXCLUDED.invited_by,
            is_active = TRUE,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(member.id)
    .bind(member.group_id)
    .bind(&member.user_id)
    .bind(member.role)
    .bind(member.joined_at)
    .bind(&member.invited_by)
    .bind(member.created_at)
    .bind(member.updated_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row)
}
