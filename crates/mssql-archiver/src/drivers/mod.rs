//! Database drivers.

pub mod mssql;
