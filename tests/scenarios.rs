//! End-to-end behaviour against the in-memory engine, plus syntax checks of
//! rendered SQL with `sqlparser`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use polydal::ast::{self, Command, Ddl, Expr};
use polydal::db::MemoryDriver;
use polydal::{
    values, Backend, Dal, DalError, Field, FieldType, InstanceRegistry, InstanceState,
    MigrateOptions, OpenOptions, Table, Value,
};
use sqlparser::dialect::{MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser as SqlParser;

fn person() -> Arc<Table> {
    Table::builder("person")
        .field(Field::new("name", FieldType::string(64)).not_null())
        .field(Field::new("age", FieldType::Integer))
        .build()
        .unwrap()
}

async fn open(
    registry: &Arc<InstanceRegistry>,
    uri: &str,
    options: OpenOptions,
) -> anyhow::Result<Dal> {
    let dal = Dal::open_in(Arc::clone(registry), uri, options).await?;
    dal.define_table(person())?;
    dal.migrate("person", MigrateOptions::default()).await?;
    Ok(dal)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn name_is(dal: &Dal, name: &str) -> Expr {
    let person = dal.table("person").unwrap();
    Expr::from(person.field("name").unwrap()).eq(name).unwrap()
}

#[tokio::test]
async fn test_insert_then_select_james() -> anyhow::Result<()> {
    init_tracing();
    let registry = Arc::new(InstanceRegistry::new());
    let dal = open(&registry, "memory://james", OpenOptions::default()).await?;

    dal.insert("person", values! { "name" => "James", "age" => 30 }).await?;
    dal.insert("person", values! { "name" => "Anna", "age" => 41 }).await?;

    let query = dal.select("person")?.filter(name_is(&dal, "James")).build()?;
    let rows = dal.fetch(query).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.first().unwrap().get("age"), Some(&Value::Int(30)));
    assert_eq!(rows.first().unwrap().try_get::<i64>("age")?, 30);

    let last = dal.last_statement().unwrap();
    assert!(last.success);
    dal.close().await?;
    assert!(registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_checkout_fails_with_pool_exhausted() -> anyhow::Result<()> {
    let registry = Arc::new(InstanceRegistry::new());
    let options = OpenOptions::default()
        .max_size(1)
        .checkout_timeout(Duration::from_millis(200));
    let dal = open(&registry, "memory://exhausted", options).await?;

    let tx = dal.begin().await?;
    let status = dal.pool_status();
    assert!(status.in_use + status.idle <= status.max_size);

    let started = Instant::now();
    let err = dal.count("person", None).await.unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, DalError::PoolExhausted { max_size: 1, .. }), "{err}");
    assert!(err.is_retryable());
    assert!(waited >= Duration::from_millis(150));
    assert!(waited < Duration::from_secs(2));

    tx.rollback().await?;
    assert_eq!(dal.count("person", None).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_opens_share_one_pool() -> anyhow::Result<()> {
    let registry = Arc::new(InstanceRegistry::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            Dal::open_in(registry, "memory://shared_pool", OpenOptions::default()).await
        }));
    }
    let mut dals = Vec::new();
    for handle in handles {
        dals.push(handle.await??);
    }
    let first = Arc::clone(dals[0].instance());
    assert!(dals.iter().all(|d| Arc::ptr_eq(d.instance(), &first)));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.refcount(&first), 8);

    for dal in dals {
        dal.close().await?;
    }
    assert!(registry.is_empty());
    assert_eq!(first.state(), InstanceState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_second_migration_performs_no_ddl() -> anyhow::Result<()> {
    let registry = Arc::new(InstanceRegistry::new());
    let dal = open(&registry, "memory://idempotent", OpenOptions::default()).await?;
    let before = dal.timings().len();
    let report = dal.migrate("person", MigrateOptions::default()).await?;
    assert!(report.applied.is_empty());
    assert_eq!(report.state, polydal::TableState::Synchronized);
    // Introspection is not a statement; nothing new was run.
    assert_eq!(dal.timings().len(), before);
    Ok(())
}

#[tokio::test]
async fn test_conflicting_transactions_do_not_lose_updates() -> anyhow::Result<()> {
    let registry = Arc::new(InstanceRegistry::new());
    let dal = open(&registry, "memory://conflict", OpenOptions::default()).await?;
    dal.insert("person", values! { "name" => "James", "age" => 30 }).await?;
    let table = dal.table("person")?;
    let set_age = |age: i64| {
        ast::update(&table)
            .set("age", age)
            .unwrap()
            .filter(name_is(&dal, "James"))
            .build()
            .unwrap()
    };

    let mut first = dal.begin().await?;
    let mut second = dal.begin().await?;
    first.execute(set_age(31).into()).await?;
    let err = second.execute(set_age(32).into()).await.unwrap_err();
    assert!(matches!(err, DalError::TransactionConflict { .. }), "{err}");
    assert!(err.is_retryable());
    // The failed transaction is finished; it cannot be resumed.
    assert!(matches!(
        second.execute(set_age(33).into()).await,
        Err(DalError::Closed(_))
    ));
    first.commit().await?;

    let rows = dal
        .fetch(dal.select("person")?.filter(name_is(&dal, "James")).build()?)
        .await?;
    assert_eq!(rows.first().unwrap().get("age"), Some(&Value::Int(31)));
    Ok(())
}

#[tokio::test]
async fn test_lost_connection_turns_zombie_and_is_reclaimed() -> anyhow::Result<()> {
    init_tracing();
    let registry = Arc::new(InstanceRegistry::new());
    let driver = Arc::new(MemoryDriver::new());
    let options = OpenOptions::default().max_size(1).driver(driver.clone());
    let dal = open(&registry, "memory://reclaim", options.clone()).await?;
    dal.insert("person", values! { "name" => "James", "age" => 30 }).await?;

    driver.sever("reclaim");
    let err = dal.count("person", None).await.unwrap_err();
    assert!(matches!(err, DalError::Connection { .. }), "{err}");
    assert_eq!(dal.state(), InstanceState::Zombie);

    driver.restore("reclaim");
    let again = Dal::open_in(Arc::clone(&registry), "memory://reclaim", options).await?;
    assert!(Arc::ptr_eq(again.instance(), dal.instance()));
    assert_eq!(again.state(), InstanceState::Active);
    assert_eq!(again.count("person", None).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_deadline_aborts_checkout() -> anyhow::Result<()> {
    let registry = Arc::new(InstanceRegistry::new());
    let options = OpenOptions::default()
        .max_size(1)
        .checkout_timeout(Duration::from_secs(5));
    let dal = open(&registry, "memory://deadline", options).await?;
    let _tx = dal.begin().await?;

    let call = polydal::CallOptions::new().timeout(Duration::from_millis(50));
    let query = dal.select("person")?.build()?;
    let started = Instant::now();
    let err = dal.fetch_with(query, &call).await.unwrap_err();
    assert!(matches!(err, DalError::DeadlineExceeded { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

fn rendered_statements(backend: Backend) -> Vec<String> {
    let person = person();
    let dog = Table::builder("dog")
        .field(Field::new("name", FieldType::Text))
        .field(Field::new("owner", FieldType::reference("person")))
        .index("dog_owner", ["owner"], false)
        .build()
        .unwrap();
    let name = Expr::from(person.field("name").unwrap());
    let age = Expr::from(person.field("age").unwrap());
    let hostile = "Robert'); DROP TABLE person;--";

    let commands: Vec<Command> = vec![
        ast::select(&person)
            .filter(name.clone().eq(hostile).unwrap())
            .order_by(person.field("age").unwrap().desc())
            .limit(10)
            .offset(20)
            .build()
            .unwrap()
            .into(),
        ast::select(&person)
            .column(name.clone())
            .column(Expr::from(dog.field("name").unwrap()))
            .join(
                &dog,
                Expr::from(dog.field("owner").unwrap())
                    .eq(person.field("id").unwrap())
                    .unwrap(),
            )
            .filter(age.clone().in_list([18, 21, 30]).unwrap())
            .build()
            .unwrap()
            .into(),
        ast::select(&person)
            .column(age.clone())
            .column_as(ast::count_all(), "n")
            .group_by(age.clone())
            .having(ast::count_all().gt(1).unwrap())
            .build()
            .unwrap()
            .into(),
        ast::insert(&person, values! { "name" => hostile, "age" => 30 })
            .unwrap()
            .into(),
        ast::update(&person)
            .set("age", 31)
            .unwrap()
            .filter(name.clone().eq("James").unwrap())
            .build()
            .unwrap()
            .into(),
        ast::delete(&person)
            .filter(age.lt(18).unwrap())
            .build()
            .unwrap()
            .into(),
    ];

    let dialect = backend.dialect();
    let mut out = Vec::new();
    for command in &commands {
        let rendered = dialect.render(command).unwrap();
        assert!(
            !rendered.text.contains("Robert"),
            "{backend}: literal interpolated into {}",
            rendered.text
        );
        out.push(rendered.text);
    }
    for table in [person, dog] {
        out.extend(dialect.render_ddl(&Ddl::CreateTable(table)).unwrap());
    }
    out.extend(
        dialect
            .render_ddl(&Ddl::AddColumn {
                table: "person".into(),
                field: Field::new("email", FieldType::string(120)),
            })
            .unwrap(),
    );
    out
}

#[test]
fn test_rendered_sql_parses_for_postgres_mysql_sqlite() {
    for statement in rendered_statements(Backend::Postgres) {
        SqlParser::parse_sql(&PostgreSqlDialect {}, &statement)
            .unwrap_or_else(|e| panic!("postgres: {statement}: {e}"));
    }
    for statement in rendered_statements(Backend::MySql) {
        SqlParser::parse_sql(&MySqlDialect {}, &statement)
            .unwrap_or_else(|e| panic!("mysql: {statement}: {e}"));
    }
    for statement in rendered_statements(Backend::Sqlite) {
        SqlParser::parse_sql(&SQLiteDialect {}, &statement)
            .unwrap_or_else(|e| panic!("sqlite: {statement}: {e}"));
    }
}
