//! Common types shared by the weather tile delivery services.
//!
//! Provider registry, canonical timeline, timestamp reconciliation and
//! tile URL building. Nothing in this crate performs I/O beyond loading
//! the provider configuration file.

pub mod bbox;
pub mod error;
pub mod layer;
pub mod provider;
pub mod reconcile;
pub mod tile;
pub mod time;
pub mod timeline;
pub mod url;

pub use bbox::{BboxParseError, BoundingBox};
pub use error::{TileError, TileResult};
pub use layer::LayerSet;
pub use provider::{ProviderDescriptor, ProviderRegistry, RequestBudget, TileScheme};
pub use reconcile::{Reconciler, ResolvedTime};
pub use tile::{latlon_to_tile, TileCoord, Viewport};
pub use time::{Quantization, TimestampEncoding};
pub use timeline::{Frame, FrameKind, Timeline, TimelineConfig};
pub use url::{build_url, proxied_url, TileUrlBuilder};
