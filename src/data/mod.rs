pub mod aggregator;
pub mod bar_store;
pub mod files;

pub use aggregator::{aggregate, rebuild, RebuildReport};
pub use bar_store::{BarStore, JsonlBarStore, MemoryBarStore};
pub use files::{export_path, find_import_file, read_bars, BarFileWriter};
