/*!
A single-node, disk-backed relational engine: databases of tables, each
table a sequence of fixed-width pages with optional B+-tree secondary
indexes, cached in memory behind a heat-ranked eviction policy and
driven by a small transaction coordinator.
*/
#![crate_type = "lib"]
#![cfg_attr(feature = "lints", deny(warnings))]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_allocation,
    unused_qualifications
)]
#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate log;
extern crate fs2;

pub mod action;
pub mod btree;
pub mod cache;
pub mod codec;
pub mod condition;
pub mod config;
pub mod constants;
pub mod database;
pub mod engine;
pub mod errors;
pub mod field;
pub mod fs;
pub mod page;
pub mod parser;
pub mod record;
pub mod table;
pub mod transaction;
