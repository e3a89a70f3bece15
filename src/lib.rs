//! Sparse layered tile maps with generated image patches.
//!
//! A [`MapDocument`] holds gameplay layers keyed by cell plus an ordered list
//! of [`Patch`]es: images covering rectangular cell regions. Regions larger
//! than the image backend accepts are split by [`tiler`], patches are
//! flattened back into one bitmap by [`compositor`], and [`service`] ties it
//! together behind the operations the web front end calls.

pub mod compositor;
pub mod document;
pub mod error;
pub mod generator;
pub mod grid;
pub mod layers;
pub mod logger;
pub mod patch;
pub mod service;
pub mod settings;
pub mod storage;
pub mod tiler;

pub use compositor::Compositor;
pub use document::MapDocument;
pub use error::{MapError, MapResult, ReleaseWarning};
pub use generator::{GeneratorError, ImageGenerator};
pub use grid::{Cell, CellRect};
pub use layers::{LayerId, LayerSet};
pub use patch::{ImageRef, Patch, PatchStore};
pub use service::MapService;
pub use settings::Settings;
pub use storage::{DirStorage, ImageStorage, MemoryStorage};
