//! Crate-wide error taxonomy.

quick_error! {
    /// Every fallible operation in this crate returns `Result<T, DbError>`.
    #[derive(Debug)]
    pub enum DbError {
        /// Duplicate name, missing name, illegal constraint combination,
        /// unknown field type.
        Schema(msg: String) {
            description("schema error")
            display("schema error: {}", msg)
        }
        /// Null violation, type mismatch, duplicate key on a primary,
        /// unique, or auto-increment field.
        Constraint(msg: String) {
            description("constraint violation")
            display("constraint violation: {}", msg)
        }
        /// A database, table, page, index, or procedure does not exist.
        NotFound(msg: String) {
            description("not found")
            display("not found: {}", msg)
        }
        /// No active database, illegal target keyword, transaction
        /// lifecycle misuse.
        State(msg: String) {
            description("invalid state")
            display("invalid state: {}", msg)
        }
        /// Illegal statement, wrong arity on a procedure call.
        Parse(msg: String) {
            description("parse error")
            display("parse error: {}", msg)
        }
        /// Filesystem or (de)serialization failure.
        Io(err: std::io::Error) {
            from()
            description("io error")
            display("io error: {}", err)
            cause(err)
        }
        /// Attempted to index an ineligible field, or the index itself
        /// is malformed on disk.
        Index(msg: String) {
            description("index error")
            display("index error: {}", msg)
        }
        /// A statement inside a transaction failed; carries the statement
        /// text that failed.
        Transaction(stmt: String) {
            description("transaction statement failed")
            display("transaction statement failed: {}", stmt)
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;
