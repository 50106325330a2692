//! Engine-wide tunables.

// Number of logical rows stored per Page before a new page is created.
// Row r lives in page floor(r / TABLE_PAGE_SIZE) at offset r % TABLE_PAGE_SIZE.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

// B+-tree minimum degree t: every non-root node holds t-1..=2t-1 keys.
// Chosen to match the behaviour described in the testable properties
// (balance holds for any t >= 2); 5 keeps node fan-out reasonable for
// in-memory arenas without excessive tree height on small tables.
pub const DEFAULT_TREE_DOMAIN: usize = 5;

// Soft cap on the number of leaf entries (pages + indexes) a TableBranch
// keeps resident before evicting the coldest one. Suspended while a
// transaction is open.
pub const DEFAULT_CACHE_BRANCH_SIZE: usize = 16;

// Statement terminator used by the REPL/adapter until changed with
// `DELIMITER <s>`.
pub const DEFAULT_DELIMITER: &str = ";";

pub const CONFIG_FILE_NAME: &str = "isadb.conf";

// Advisory lock acquired on the data directory for the lifetime of the
// process, enforcing the single-writer assumption.
pub const LOCK_FILE_NAME: &str = "isadb.lock";

pub const DB_OBJ_EXT: &str = "obj";
pub const RECORD_EXT: &str = "rcd";
pub const TABLE_OBJ_EXT: &str = "obj";
pub const PAGE_EXT: &str = "data";
pub const INDEX_EXT: &str = "idx";

// Length, in ASCII letters, of an auto-generated root password.
pub const GENERATED_PASSWORD_LEN: usize = 10;
