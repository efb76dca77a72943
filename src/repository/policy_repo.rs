//! Policy repository (权限规则持久化)

use async_trait::async_trait;
use sqlx::PgPool;

use super::PolicyRepository;
use crate::{
    error::Result,
    models::policy::{GroupingRule, PolicyRule},
};

const POLICY_COLUMNS: [&str; 3] = ["subject", "object", "action"];
const GROUPING_COLUMNS: [&str; 2] = ["user_id", "role"];

pub struct PgPolicyRepository {
    db: PgPool,
}

impl PgPolicyRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// 生成按列过滤的 WHERE 子句，空值表示该列不限
fn filter_clause(columns: &[&str], field_index: usize, values: &[String]) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();
    for (offset, value) in values.iter().enumerate() {
        if value.is_empty() {
            continue;
        }
        if let Some(column) = columns.get(field_index + offset) {
            binds.push(value.clone());
            conditions.push(format!("{} = ${}", column, binds.len()));
        }
    }
    if conditions.is_empty() {
        ("TRUE".to_string(), binds)
    } else {
        (conditions.join(" AND "), binds)
    }
}

#[async_trait]
impl PolicyRepository for PgPolicyRepository {
    async fn load_all(&self) -> Result<(Vec<PolicyRule>, Vec<GroupingRule>)> {
        let policies = sqlx::query_as::<_, PolicyRule>(
            "SELECT subject, object, action FROM policies ORDER BY subject, object",
        )
        .fetch_all(&self.db)
        .await?;

        let groupings =
            sqlx::query_as::<_, GroupingRule>("SELECT user_id, role FROM groupings ORDER BY user_id")
                .fetch_all(&self.db)
                .await?;

        Ok((policies, groupings))
    }

    async fn insert_policy(&self, rule: &PolicyRule) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO policies (subject, object, action)
            VALUES ($1, $2, $3)
            ON CONFLICT (subject, object, action) DO NOTHING
            "#,
        )
        .bind(&rule.subject)
        .bind(&rule.object)
        .bind(&rule.action)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_policy(&self, rule: &PolicyRule) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM policies WHERE subject = $1 AND object = $2 AND action = $3")
                .bind(&rule.subject)
                .bind(&rule.object)
                .bind(&rule.action)
                .execute(&self.db)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_policies_where(&self, field_index: usize, values: &[String]) -> Result<Vec<PolicyRule>> {
        let (clause, binds) = filter_clause(&POLICY_COLUMNS, field_index, values);
        let sql = format!(
            "DELETE FROM policies WHERE {} RETURNING subject, object, action",
            clause
        );
        let mut query = sqlx::query_as::<_, PolicyRule>(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        Ok(query.fetch_all(&self.db).await?)
    }

    async fn insert_grouping(&self, rule: &GroupingRule) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO groupings (user_id, role)
            VALUES ($1, $2)
            ON CONFLICT (user_id, role) DO NOTHING
            "#,
        )
        .bind(&rule.user_id)
        .bind(&rule.role)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_grouping(&self, rule: &GroupingRule) -> Result<bool> {
        let result = sqlx::query("DELETE FROM groupings WHERE user_id = $1 AND role = $2")
            .bind(&rule.user_id)
            .bind(&rule.role)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_groupings_where(&self, field_index: usize, values: &[String]) -> Result<Vec<GroupingRule>> {
        let (clause, binds) = filter_clause(&GROUPING_COLUMNS, field_index, values);
        let sql = format!("DELETE FROM groupings WHERE {} RETURNING user_id, role", clause);
        let mut query = sqlx::query_as::<_, GroupingRule>(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        Ok(query.fetch_all(&self.db).await?)
    }
}
