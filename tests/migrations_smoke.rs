use sqlx::Row;

fn database_url() -> Option<String> {
    dotenvy::dotenv().ok();

    std::env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty())
}

#[tokio::test]
async fn migrations_apply_and_tables_exist() -> anyhow::Result<()> {
    let Some(database_url) = database_url() else {
        eprintln!("DATABASE_URL is not set; skipping migrations smoke test");
        return Ok(());
    };

    let pool =
        sqlx::postgres::PgPoolOptions::new().max_connections(1).connect(&database_url).await?;

    let migrations_dir =
        std::env::var("EXAMFLOW_MIGRATIONS_DIR").unwrap_or_else(|_| "migrations".to_string());
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(&migrations_dir)).await?;
    migrator.run(&pool).await?;

    let tables = [
        "tests",
        "test_sections",
        "test_slots",
        "group_members",
        "test_overrides",
        "item_usages",
        "test_attempts",
    ];

    for table in tables {
        let row = sqlx::query("SELECT to_regclass($1)::text").bind(table).fetch_one(&pool).await?;
        let regclass: Option<String> = row.try_get(0)?;
        assert!(regclass.is_some(), "expected table {table} to exist after migrations");
    }

    let row = sqlx::query(
        "SELECT count(*) FROM pg_indexes WHERE tablename = 'test_attempts' \
         AND indexdef LIKE '%UNIQUE%'",
    )
    .fetch_one(&pool)
    .await?;
    let unique_indexes: i64 = row.try_get(0)?;
    assert!(unique_indexes >= 1, "attempt numbers must be unique per learner and test");

    Ok(())
}
