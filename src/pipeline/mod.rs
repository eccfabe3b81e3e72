//! # Response Pipeline
//!
//! Stages that sit between the (possibly cached) model stream and the
//! client.
//!
//! ```text
//! model/replay → ToolRunner → StreamMerger → StreamPart
//!                    │             ▲    │
//!                    └─annotations─┘    └─finish hook → PersistenceSink
//! ```
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ToolRunner`] | Executes routed tools and inserts `tool-result` chunks |
//! | [`StreamMerger`] | Orders chunks and annotations; holds `finish` until writes are issued |
//! | [`PersistenceSink`] | Sanitizes and writes message rows |
//! | [`ResponseAccumulator`] | Folds chunks into role turns |
//!
//! ## Submodules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`accumulate`] | Chunk to turn folding |
//! | [`sanitize`] | Dangling tool-call removal |
//! | [`tools`] | Tool trait, registry, runner |
//! | [`merge`] | Outbound merger and finish hook |
//! | [`persist`] | Message stores and the persistence sink |

pub mod accumulate;
pub mod merge;
pub mod persist;
pub mod sanitize;
pub mod tools;

pub use accumulate::{ResponseAccumulator, ResponseTurn};
pub use merge::{FinishHook, StreamMerger};
pub use persist::{InMemoryMessageStore, MessageStore, PersistOnFinish, PersistenceSink};
pub use sanitize::sanitize_turns;
pub use tools::{
    annotation_channel, AnnotationReceiver, AnnotationSender, CurrentTimeTool, DescribeImageTool, Tool, ToolContext,
    ToolRegistry, ToolRunner, DESCRIBE_IMAGE_TOOL,
};
