pub mod btree;
pub mod buffer;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod exec;
pub mod fault;
pub mod io;
pub mod plan;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utils;
pub mod wal;

pub use crate::{
    config::{DbConfig, FsyncMode},
    database::{Database, Session, DEFAULT_DB},
    error::{ErrorKind, GraniteError},
    exec::QueryResult,
    transaction::Transaction,
};
