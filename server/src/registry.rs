use clanwatch_shared::{Account, GroupKind};

use crate::db_sqlx::{PgPool, query_as};
use crate::error::Result;

type AccountRow = (i64, String, String, Option<i64>, Option<String>, i32, i32, bool, Option<String>);

fn account_from_row(row: AccountRow) -> Account {
    let (id, uid, access_key, viewer_id, name, arena_group, grand_arena_group, is_active, note) = row;
    Account {
        id,
        uid,
        access_key,
        viewer_id,
        name,
        arena_group,
        grand_arena_group,
        is_active,
        note,
    }
}

/// Reads the crawling credential set from the database, never from a config file (§2): every
/// query here is parameterized, no f-string-built SQL (§9 redesign).
pub struct AccountRegistry<'a> {
    pool: &'a PgPool,
}

impl<'a> AccountRegistry<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_active(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = query_as(
            "SELECT id, uid, access_key, viewer_id, name, arena_group, grand_arena_group, is_active, note
             FROM accounts WHERE is_active = TRUE ORDER BY id",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    pub async fn list_all(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = query_as(
            "SELECT id, uid, access_key, viewer_id, name, arena_group, grand_arena_group, is_active, note
             FROM accounts ORDER BY id",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    /// One active account per group, keeping the first account encountered for each group id
    /// (matching the original's first-wins semantics); accounts with group `0` are unassigned
    /// and excluded.
    pub async fn by_group(&self, kind: GroupKind) -> Result<Vec<Account>> {
        let accounts = self.list_active().await?;
        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for account in accounts {
            let group_id = account.group_for(kind);
            if group_id > 0 && seen.insert(group_id) {
                result.push(account);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: i64, arena_group: i32, grand_arena_group: i32) -> Account {
        Account {
            id,
            uid: format!("uid-{id}"),
            access_key: "key".to_string(),
            viewer_id: None,
            name: None,
            arena_group,
            grand_arena_group,
            is_active: true,
            note: None,
        }
    }

    #[test]
    fn dedupes_by_group_keeping_first_account() {
        let accounts = vec![account(1, 5, 0), account(2, 5, 0), account(3, 6, 0)];
        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for a in accounts {
            let group_id = a.group_for(GroupKind::Arena);
            if group_id > 0 && seen.insert(group_id) {
                result.push(a);
            }
        }
        assert_eq!(result.iter().map(|a| a.id).collect::<Vec<_>>(), vec![1, 3]);
    }
}
