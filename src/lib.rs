pub mod cache;
pub mod canon;
pub mod clean;
pub mod db;
pub mod decider;
mod densemap;
mod depfile;
mod eval;
pub mod fs;
pub mod graph;
mod lexer;
pub mod load;
mod parse;
mod process;
pub mod progress;
pub mod run;
pub mod scan;
pub mod sig;
mod signal;
mod smallmap;
pub mod task;
mod terminal;
pub mod trace;
pub mod work;
