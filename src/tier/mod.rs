//! Compressed secondary storage tier
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │                 Manager                  │
//!                 │ create/register · find/destroy · compact │
//!                 └───────┬───────────────────────┬──────────┘
//!                         │                       │
//!                 ┌───────▼────────┐      ┌───────▼───────┐
//!                 │      Area      │      │ PrimaryStore  │
//!                 │ bitmap · frag  │      │ object meta   │
//!                 └──┬─────────┬───┘      └───────────────┘
//!                    │         │
//!          ┌─────────▼──┐  ┌───▼──────────┐
//!          │ ListTable  │  │ ExtentCache  │
//!          │ x2 lanes   │  │ pins · Arc   │
//!          └─────┬──────┘  └──────────────┘
//!                │
//!          ┌─────▼──────────┐
//!          │ GroupDirectory │
//!          └────────────────┘
//! ```

pub mod area;
pub mod bitmap;
pub mod cache;
pub mod compression;
pub mod group;
pub mod index;
pub mod list;
pub mod manager;
pub mod pages;
pub mod shrinker;
pub mod stats;
pub mod store;

pub use area::{Area, ExtentFilter, FragStats};
pub use cache::{CacheStats, ExtentCache};
pub use compression::CompressionAlgorithm;
pub use group::{GroupDirectory, GroupRecord, GroupRegistry, GroupStats};
pub use index::{ExtentId, Geometry, GroupId, IndexSpace, ObjectId, Slot, PAGE_SIZE};
pub use manager::{ExtentIo, FaultIn, Manager, PackedObject, Scenario};
pub use pages::ExtentPages;
pub use shrinker::Shrinker;
pub use stats::{StatsSnapshot, TierStats};
pub use store::{MemoryStore, ObjectFlags, ObjectMeta, PrimaryStore};
