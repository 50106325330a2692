//! The contract between a statement adapter (parser, REPL, or any other
//! frontend) and the engine: `Action` is what it sends, `ActionResult`
//! is what it gets back.

use indexmap::IndexMap;

use crate::condition::Case;
use crate::field::{FieldConstraints, FieldType, FieldValue};
use crate::table::Row;

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ty: FieldType,
    pub constraints: FieldConstraints,
    pub default: FieldValue,
}

#[derive(Debug, Clone)]
pub enum Action {
    CreateDatabase { name: String },
    DropDatabase { name: String },
    Use { name: String },
    ShowDatabases,
    ShowTables,

    CreateTable { name: String, columns: Vec<ColumnDef> },
    DropTable { name: String },

    CreateIndex { name: String, table: String, field: String },
    DropIndex { name: String, table: String },

    /// `columns` is `None` when the statement omitted an explicit column
    /// list; the engine then maps `values` onto the schema positionally.
    Insert { table: String, columns: Option<Vec<String>>, values: Vec<FieldValue> },
    Update { table: String, values: Row, conditions: IndexMap<String, Case> },
    Delete { table: String, conditions: IndexMap<String, Case> },
    Search { table: String, fields: Vec<String>, conditions: IndexMap<String, Case>, desc: bool },

    CreateProcedure { name: String, params: Vec<String>, statements: Vec<String> },
    DropProcedure { name: String },
    CallProcedure { name: String, args: Vec<String> },

    Begin,
    Commit,
    Rollback,
    Exit,
}

#[derive(Debug, Clone)]
pub enum ActionResult {
    Unit,
    Message(String),
    RowsAffected(usize),
    Rows(Vec<Row>),
    Names(Vec<String>),
}
