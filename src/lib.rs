#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! schemadeck — MySQL schema administration: migration snapshots, schema
//! drops, and mysqldump backups. All database work shells out to the
//! `mysql`/`mysqldump` binaries; this crate is the orchestration around them.

pub mod apply;
pub mod backup;
pub mod config;
pub mod doctor;
pub mod gateway;
pub mod health;
pub mod mysql;
pub mod snapshot;

pub use config::Config;
