//! Generation-ordered submission of job trees to local and batch schedulers

pub mod config;
pub mod configure;
pub mod dependency;
pub mod executors;
pub mod idmap;
pub mod reconcile;
pub mod registry;
pub mod runscript;
pub mod shell;
pub mod submit;
pub mod sync;
pub mod tree;

#[cfg(test)]
mod testing;
