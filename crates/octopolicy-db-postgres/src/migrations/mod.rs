//! Schema migrations compiled into the binary and applied on startup.
//!
//! Applied versions are tracked in `_sqlx_migrations`. New files go under
//! `migrations/` and get appended to [`MIGRATIONS`].

use std::borrow::Cow;

use sqlx_core::migrate::{Migration, MigrationType, Migrator};
use sqlx_postgres::PgPool;
use tracing::info;

use crate::error::Result;

const MIGRATIONS: &[(i64, &str, &str)] = &[(
    20250301000001,
    "policy_schema",
    include_str!("../../migrations/20250301000001_policy_schema.sql"),
)];

fn migrator() -> Migrator {
    let migrations = MIGRATIONS
        .iter()
        .map(|&(version, description, sql)| Migration {
            version,
            description: Cow::Borrowed(description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(sql),
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect();
    Migrator {
        migrations: Cow::Owned(migrations),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    }
}

pub async fn run(pool: &PgPool) -> Result<()> {
    let migrator = migrator();
    migrator.run(pool).await?;
    info!(count = migrator.migrations.len(), "Policy schema up to date");
    Ok(())
}
