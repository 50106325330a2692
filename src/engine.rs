//! Ties `Settings`, `CachePool`, and `TransactionState` into one
//! explicit context and dispatches `Action`s against it. Replaces the
//! process-wide `Config`/`CachePool` singletons with a value an
//! adapter owns and threads through (Design Notes §9); only the CLI
//! binary keeps a `lazy_static` instance, and only at its entry point.
//!
//! `CachePool` lives behind an `Arc<Mutex<_>>` so the transaction
//! worker thread (`transaction::TransactionState::begin`) can share it
//! with the caller: ordinary dispatch locks it for one action, the
//! worker locks it once per queued statement while a transaction is
//! open.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::action::{Action, ActionResult, ColumnDef};
use crate::cache::{CachePool, DbBranch, TableBranch};
use crate::condition::Case;
use crate::config::Settings;
use crate::constants::RECORD_EXT;
use crate::database::Database;
use crate::errors::{DbError, Result};
use crate::field::{FieldConstraints, FieldSchema, FieldValue};
use crate::fs as dbfs;
use crate::record::{ProcedureDef, Record};
use crate::table::{Row, Table};
use crate::transaction::TransactionState;

#[derive(Debug)]
pub struct Engine {
    pub settings: Settings,
    pub pool: Arc<Mutex<CachePool>>,
    pub transaction: TransactionState,
    /// Held for the engine's lifetime; releasing it (by dropping the
    /// engine) frees the data directory for another process.
    _lock: File,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        let lock = dbfs::lock_data_dir(&settings.data_path).expect("failed to lock data directory");
        let pool = Arc::new(Mutex::new(CachePool::new(settings.data_path.clone())));
        Engine { settings, pool, transaction: TransactionState::default(), _lock: lock }
    }

    pub fn bootstrap(work_path: PathBuf) -> Result<Self> {
        let settings = Settings::load_or_create(work_path)?;
        dbfs::ensure_dir(&settings.data_path)?;
        let lock = dbfs::lock_data_dir(&settings.data_path)?;
        let pool = Arc::new(Mutex::new(CachePool::new(settings.data_path.clone())));
        Ok(Engine { settings, pool, transaction: TransactionState::default(), _lock: lock })
    }

    /// Parses and executes one statement, routing it through the open
    /// transaction's worker queue if one exists. This is the entry
    /// point a REPL/adapter should call; `dispatch` stays available for
    /// callers that already hold a parsed `Action` (tests, stored
    /// procedures).
    pub fn execute_statement(&mut self, text: &str) -> Result<ActionResult> {
        let action = crate::parser::parse_statement(text)?;
        match action {
            Action::Begin => {
                self.transaction.begin(&self.pool, &self.settings)?;
                Ok(ActionResult::Message("transaction started".into()))
            }
            Action::Commit if self.transaction.is_open() => {
                self.transaction.commit(&self.pool)?;
                Ok(ActionResult::Message("transaction committed".into()))
            }
            Action::Rollback if self.transaction.is_open() => {
                self.transaction.rollback(&self.pool)?;
                Ok(ActionResult::Message("transaction rolled back".into()))
            }
            _ if self.transaction.is_open() => self.transaction.execute(text),
            other => self.dispatch(other),
        }
    }

    pub fn dispatch(&mut self, action: Action) -> Result<ActionResult> {
        match action {
            Action::Begin => {
                self.transaction.begin(&self.pool, &self.settings)?;
                Ok(ActionResult::Message("transaction started".into()))
            }
            Action::Commit => {
                self.transaction.commit(&self.pool)?;
                Ok(ActionResult::Message("transaction committed".into()))
            }
            Action::Rollback => {
                self.transaction.rollback(&self.pool)?;
                Ok(ActionResult::Message("transaction rolled back".into()))
            }
            Action::Exit => Ok(ActionResult::Unit),
            other => {
                let mut guard = self.pool.lock().expect("cache pool mutex poisoned");
                execute_action(&mut guard, &self.settings, other)
            }
        }
    }
}

/// Runs one already-parsed, non-transaction-control action against the
/// pool. Shared by `Engine::dispatch` (direct calls) and the
/// transaction worker thread (queued statement text, reparsed), so a
/// statement behaves identically whether it runs immediately or inside
/// a transaction.
pub(crate) fn execute_action(pool: &mut CachePool, settings: &Settings, action: Action) -> Result<ActionResult> {
    match action {
        Action::CreateDatabase { name } => create_database(pool, settings, &name),
        Action::DropDatabase { name } => drop_database(pool, settings, &name),
        Action::Use { name } => use_database(pool, &name),
        Action::ShowDatabases => show_databases(settings),
        Action::ShowTables => show_tables(pool),

        Action::CreateTable { name, columns } => create_table(pool, settings, &name, columns),
        Action::DropTable { name } => drop_table(pool, settings, &name),

        Action::CreateIndex { name, table, field } => create_index(pool, settings, &table, &name, &field),
        Action::DropIndex { name, table } => drop_index(pool, settings, &table, &name),

        Action::Insert { table, columns, values } => insert(pool, settings, &table, columns, values),
        Action::Update { table, values, conditions } => update(pool, settings, &table, values, conditions),
        Action::Delete { table, conditions } => delete(pool, settings, &table, conditions),
        Action::Search { table, fields, conditions, desc } => search(pool, settings, &table, &fields, conditions, desc),

        Action::CreateProcedure { name, params, statements } => create_procedure(pool, &name, params, statements),
        Action::DropProcedure { name } => drop_procedure(pool, &name),
        Action::CallProcedure { name, args } => call_procedure(pool, settings, &name, args),

        Action::Begin | Action::Commit | Action::Rollback => {
            Err(DbError::Transaction("nested transactions are not supported".into()))
        }
        Action::Exit => Ok(ActionResult::Unit),
    }
}

fn current_db_name(pool: &CachePool) -> Result<String> {
    pool.current_db_name().map(|s| s.to_string()).ok_or_else(|| DbError::State("no database selected".into()))
}

fn db_dir(settings: &Settings, db_name: &str) -> PathBuf {
    let mut dir = settings.data_path.clone();
    dir.push(db_name);
    dir
}

/// Every statement that touches the current database's metadata routes
/// through here: `CachePool::get_cache` commits whatever was active
/// before, unconditionally, whenever auto-commit is on — the literal
/// per-statement commit-then-switch behaviour a transaction suspends.
fn current_branch(pool: &mut CachePool) -> Result<&mut DbBranch> {
    let name = current_db_name(pool)?;
    pool.get_cache(&name)
}

fn table_branch<'a>(pool: &'a mut CachePool, settings: &Settings, table_name: &str) -> Result<&'a mut TableBranch> {
    let db_name = current_db_name(pool)?;
    let page_size = settings.page_size;
    let tree_domain = settings.tree_domain;
    let dir = db_dir(settings, &db_name);

    let branch = pool.get_cache(&db_name)?;
    if !branch.tables.contains_key(table_name) {
        if !branch.database.has_table(table_name) {
            return Err(DbError::NotFound(format!("{} is not exists.", table_name)));
        }
        let schema = branch.record.get_table_field(table_name)?.to_vec();
        let table = Table::load_or_create(dir, &db_name, table_name, schema, page_size, tree_domain)?;
        branch.add_table_branch(table_name.to_string(), TableBranch::new(table));
    }
    Ok(branch.table_branch(table_name).expect("just inserted or already present"))
}

fn create_database(pool: &mut CachePool, settings: &Settings, name: &str) -> Result<ActionResult> {
    if pool.has_branch(name) {
        return Err(DbError::Schema(format!("{} is exist.", name)));
    }
    let dir = db_dir(settings, name);
    let database = Database::load_or_create(dir.clone(), name)?;
    let mut record_path = dir;
    record_path.push(format!("{}.{}", name, RECORD_EXT));
    let record = Record::load_or_create(record_path, name)?;
    pool.add_branch(name, DbBranch::new(database, record));
    Ok(ActionResult::Message(format!("Database {} created.", name)))
}

fn drop_database(pool: &mut CachePool, settings: &Settings, name: &str) -> Result<ActionResult> {
    let dir = db_dir(settings, name);
    if !pool.has_branch(name) && !dbfs::exists(&dir) {
        return Err(DbError::NotFound(format!("{} is not exists.", name)));
    }
    pool.drop_branch(name);
    dbfs::remove_dir_all(&dir)?;
    Ok(ActionResult::Message(format!("Database {} dropped.", name)))
}

fn use_database(pool: &mut CachePool, name: &str) -> Result<ActionResult> {
    if !pool.has_branch(name) {
        return Err(DbError::NotFound(format!("{} is not exists.", name)));
    }
    pool.get_cache(name)?;
    Ok(ActionResult::Message(format!("Database changed to {}.", name)))
}

fn show_databases(settings: &Settings) -> Result<ActionResult> {
    Ok(ActionResult::Names(dbfs::list_subdirs(&settings.data_path)?))
}

fn show_tables(pool: &mut CachePool) -> Result<ActionResult> {
    let branch = current_branch(pool)?;
    Ok(ActionResult::Names(branch.database.tables().to_vec()))
}

fn create_table(pool: &mut CachePool, settings: &Settings, name: &str, columns: Vec<ColumnDef>) -> Result<ActionResult> {
    let schema: Vec<FieldSchema> =
        columns.into_iter().map(|c| FieldSchema::new(c.name, c.ty, c.constraints, c.default)).collect();
    for field_schema in &schema {
        field_schema.validate()?;
    }
    if schema.iter().filter(|f| f.constraints.contains(FieldConstraints::PRIMARY)).count() != 1 {
        return Err(DbError::Schema(format!("{} must have exactly one primary key column", name)));
    }

    let db_name = current_db_name(pool)?;
    let page_size = settings.page_size;
    let tree_domain = settings.tree_domain;
    let dir = db_dir(settings, &db_name);

    let branch = pool.get_cache(&db_name)?;
    branch.database.create_table(name)?;
    branch.record.add_table_field(name, schema.clone());
    branch.database.commit()?;
    branch.record.commit()?;

    let table = Table::new(dir, &db_name, name, schema, page_size, tree_domain);
    table.commit()?;
    branch.add_table_branch(name.to_string(), TableBranch::new(table));
    Ok(ActionResult::Message(format!("Table {} created.", name)))
}

fn drop_table(pool: &mut CachePool, settings: &Settings, name: &str) -> Result<ActionResult> {
    let db_name = current_db_name(pool)?;
    let mut table_obj = db_dir(settings, &db_name);
    table_obj.push(format!("{}.obj", name));

    let branch = pool.get_cache(&db_name)?;
    branch.database.drop_table(name)?;
    branch.record.delete_table_field(name);
    branch.drop_table_branch(name);
    branch.database.commit()?;
    branch.record.commit()?;

    let _ = std::fs::remove_file(table_obj);
    Ok(ActionResult::Message(format!("Table {} dropped.", name)))
}

fn create_index(pool: &mut CachePool, settings: &Settings, table_name: &str, index_name: &str, field_name: &str) -> Result<ActionResult> {
    let auto_commit = pool.auto_commit();
    table_branch(pool, settings, table_name)?.create_index(index_name, field_name, auto_commit)?;
    Ok(ActionResult::Message(format!("Index {} created.", index_name)))
}

fn drop_index(pool: &mut CachePool, settings: &Settings, table_name: &str, index_name: &str) -> Result<ActionResult> {
    table_branch(pool, settings, table_name)?.drop_index(index_name)?;
    Ok(ActionResult::Message(format!("Index {} dropped.", index_name)))
}

/// With no explicit column list, maps `values` onto the schema in
/// order — either every column, or every column but the primary key
/// (the common case: an auto-increment id left for the engine to
/// assign).
fn insert(pool: &mut CachePool, settings: &Settings, table_name: &str, columns: Option<Vec<String>>, values: Vec<FieldValue>) -> Result<ActionResult> {
    let auto_commit = pool.auto_commit();
    let (schema_names, pk_name) = {
        let branch = table_branch(pool, settings, table_name)?;
        (branch.table.schema.iter().map(|f| f.name.clone()).collect::<Vec<_>>(), branch.table.primary_field()?.name.clone())
    };

    let column_names = match columns {
        Some(cols) => cols,
        None if values.len() == schema_names.len() => schema_names,
        None if values.len() + 1 == schema_names.len() => {
            schema_names.into_iter().filter(|n| *n != pk_name).collect()
        }
        None => {
            return Err(DbError::Parse(format!(
                "{}: INSERT without a column list must supply one value per column (or one fewer, omitting the primary key)",
                table_name
            )))
        }
    };
    if column_names.len() != values.len() {
        return Err(DbError::Parse(format!("{}: column/value count mismatch", table_name)));
    }

    let mut row = Row::new();
    for (name, value) in column_names.into_iter().zip(values) {
        row.insert(name, value);
    }
    let pk = table_branch(pool, settings, table_name)?.insert_row(row, auto_commit)?;
    Ok(ActionResult::Message(format!("1 row inserted (id={}).", pk)))
}

fn update(pool: &mut CachePool, settings: &Settings, table_name: &str, values: Row, conditions: IndexMap<String, Case>) -> Result<ActionResult> {
    let auto_commit = pool.auto_commit();
    let n = table_branch(pool, settings, table_name)?.update_rows(&values, &conditions, auto_commit)?;
    Ok(ActionResult::RowsAffected(n))
}

fn delete(pool: &mut CachePool, settings: &Settings, table_name: &str, conditions: IndexMap<String, Case>) -> Result<ActionResult> {
    let auto_commit = pool.auto_commit();
    let n = table_branch(pool, settings, table_name)?.delete_rows(&conditions, auto_commit)?;
    Ok(ActionResult::RowsAffected(n))
}

fn search(
    pool: &mut CachePool,
    settings: &Settings,
    table_name: &str,
    fields: &[String],
    conditions: IndexMap<String, Case>,
    desc: bool,
) -> Result<ActionResult> {
    let auto_commit = pool.auto_commit();
    let rows = table_branch(pool, settings, table_name)?.search_rows(fields, &conditions, desc, auto_commit)?;
    Ok(ActionResult::Rows(rows))
}

fn create_procedure(pool: &mut CachePool, name: &str, params: Vec<String>, statements: Vec<String>) -> Result<ActionResult> {
    let branch = current_branch(pool)?;
    branch.record.create_procedure(name, ProcedureDef { params, statements })?;
    branch.record.commit()?;
    Ok(ActionResult::Message(format!("Procedure {} created.", name)))
}

fn drop_procedure(pool: &mut CachePool, name: &str) -> Result<ActionResult> {
    let branch = current_branch(pool)?;
    branch.record.delete_procedure(name)?;
    branch.record.commit()?;
    Ok(ActionResult::Message(format!("Procedure {} dropped.", name)))
}

fn call_procedure(pool: &mut CachePool, settings: &Settings, name: &str, args: Vec<String>) -> Result<ActionResult> {
    let (params, statements) = {
        let branch = current_branch(pool)?;
        let def = branch.record.get_procedure(name)?;
        (def.params.clone(), def.statements.clone())
    };
    if params.len() != args.len() {
        return Err(DbError::Parse(format!(
            "{} expects {} argument(s), got {}",
            name,
            params.len(),
            args.len()
        )));
    }

    let mut last = ActionResult::Unit;
    for statement in statements {
        let substituted = substitute_params(&statement, &params, &args);
        let action = crate::parser::parse_statement(&substituted).map_err(|e| {
            error!("{}: procedure statement failed to parse: {}", name, e);
            e
        })?;
        last = execute_action(pool, settings, action).map_err(|e| {
            error!("{}: procedure statement failed: {}", name, e);
            e
        })?;
    }
    Ok(last)
}

/// Quotes non-numeric arguments so the substituted text still
/// re-tokenizes as a value where the placeholder stood (numbers are
/// left bare so they remain numeric literals, not strings).
fn substitute_params(statement: &str, params: &[String], args: &[String]) -> String {
    let mut out = statement.to_string();
    for (param, arg) in params.iter().zip(args.iter()) {
        let replacement = if arg.parse::<f64>().is_ok() { arg.clone() } else { format!("'{}'", arg) };
        out = out.replace(param, &replacement);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldType;

    fn new_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::bootstrap(dir.path().to_path_buf()).unwrap();
        (dir, engine)
    }

    fn id_column() -> ColumnDef {
        ColumnDef {
            name: "id".to_string(),
            ty: FieldType::Int,
            constraints: FieldConstraints::PRIMARY | FieldConstraints::AUTO_INCREMENT,
            default: FieldValue::Null,
        }
    }

    #[test]
    fn full_lifecycle_create_use_insert_search() {
        let (_dir, mut engine) = new_engine();
        engine.dispatch(Action::CreateDatabase { name: "shop".into() }).unwrap();
        engine.dispatch(Action::Use { name: "shop".into() }).unwrap();
        engine
            .dispatch(Action::CreateTable {
                name: "items".into(),
                columns: vec![
                    id_column(),
                    ColumnDef {
                        name: "name".into(),
                        ty: FieldType::Text,
                        constraints: FieldConstraints::empty(),
                        default: FieldValue::Null,
                    },
                ],
            })
            .unwrap();

        engine
            .dispatch(Action::Insert {
                table: "items".into(),
                columns: Some(vec!["name".into()]),
                values: vec![FieldValue::Text("widget".into())],
            })
            .unwrap();

        let result = engine
            .dispatch(Action::Search {
                table: "items".into(),
                fields: Vec::new(),
                conditions: IndexMap::new(),
                desc: false,
            })
            .unwrap();
        match result {
            ActionResult::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn transaction_rollback_discards_writes() {
        let (_dir, mut engine) = new_engine();
        engine.dispatch(Action::CreateDatabase { name: "shop".into() }).unwrap();
        engine.dispatch(Action::Use { name: "shop".into() }).unwrap();
        engine
            .dispatch(Action::CreateTable { name: "items".into(), columns: vec![id_column()] })
            .unwrap();

        engine.dispatch(Action::Begin).unwrap();
        engine.dispatch(Action::Insert { table: "items".into(), columns: None, values: Vec::new() }).unwrap();
        engine.dispatch(Action::Rollback).unwrap();

        let result = engine
            .dispatch(Action::Search {
                table: "items".into(),
                fields: Vec::new(),
                conditions: IndexMap::new(),
                desc: false,
            })
            .unwrap();
        match result {
            ActionResult::Rows(rows) => assert_eq!(rows.len(), 0),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn transaction_worker_runs_queued_statements_and_stops_after_failure() {
        let (_dir, mut engine) = new_engine();
        engine.dispatch(Action::CreateDatabase { name: "shop".into() }).unwrap();
        engine.dispatch(Action::Use { name: "shop".into() }).unwrap();
        engine
            .dispatch(Action::CreateTable { name: "items".into(), columns: vec![id_column()] })
            .unwrap();

        engine.execute_statement("BEGIN").unwrap();
        engine.execute_statement("INSERT INTO items VALUES (1)").unwrap();
        let failure = engine.execute_statement("INSERT INTO missing VALUES (1)");
        assert!(failure.is_err());
        let after_failure = engine.execute_statement("INSERT INTO items VALUES (2)");
        assert!(after_failure.is_err(), "worker should stop consuming after the first failure");
        engine.execute_statement("COMMIT").unwrap();

        let result = engine
            .dispatch(Action::Search {
                table: "items".into(),
                fields: Vec::new(),
                conditions: IndexMap::new(),
                desc: false,
            })
            .unwrap();
        match result {
            ActionResult::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected rows, got {:?}", other),
        }
    }
}
