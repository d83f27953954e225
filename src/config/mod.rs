pub mod context;
pub mod loader;

pub use context::OperationContext;
pub use loader::{
    load_settings, validate_settings, FileFormat, FileLayout, ReplacePolicy, Settings, StoreKind,
};
