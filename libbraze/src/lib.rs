//! The core of the braze static linker: symbol resolution, input section merging into output
//! fragment streams, output relocation pools, unwind table merging and ARM/Thumb branch-range
//! stubs.
//!
//! The intended driving order is: create a [`LinkContext`], feed it sections, symbols and
//! relocations from the inputs, run [`LinkContext::layout`], then let a [`StubEngine`] scan and
//! re-layout until it stops inserting trampolines.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod context;
pub mod eh_frame;
pub mod error;
pub mod fragment;
pub(crate) mod hash;
pub mod reloc;
pub mod resolve;
pub mod section;
pub mod section_map;
pub mod stub;
pub mod symbol;
pub mod symbol_db;

pub use context::LinkConfig;
pub use context::LinkContext;
pub use eh_frame::EhFrame;
pub use fragment::Fragment;
pub use reloc::OutputRelocPool;
pub use resolve::Resolver;
pub use stub::StubEngine;
pub use symbol_db::SymbolDb;

/// Installs the default tracing subscriber. Filtering follows `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
