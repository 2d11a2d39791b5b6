pub mod backend;
pub mod commands;
pub mod config;
pub mod models;
pub mod persistence;
pub mod store;
pub mod stream;
pub mod tasks;
pub mod title;

#[cfg(test)]
pub(crate) mod testing;
