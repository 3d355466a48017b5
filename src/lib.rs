//! sectorfs: a single-volume block-addressable file store, with a
//! second-chance buffer cache, multi-level-indexed inodes, and
//! hierarchical directories layered on top of any [`device::BlockDevice`].
//
// # Tries to deny all lints (`rustc -W help`).
#![deny(absolute_paths_not_starting_with_crate)]
#![deny(anonymous_parameters)]
#![deny(deprecated_in_future)]
#![deny(elided_lifetimes_in_paths)]
#![deny(explicit_outlives_requirements)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(missing_debug_implementations)]
#![deny(non_ascii_idents)]
#![deny(rust_2018_idioms)]
#![deny(trivial_numeric_casts)]
#![deny(unused_extern_crates)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
//
// # TODO: deny them one day.
//
// #![deny(missing_docs)]
// #![deny(single_use_lifetimes)]
// #![deny(unreachable_pub)]

pub mod cache;
pub mod device;
pub mod error;
pub mod freemap;
pub mod fs;
pub mod lock;
pub mod param;
pub mod task;
