pub mod collection;
pub mod error;
pub mod history;
pub mod name;
pub mod recorder;
pub mod rotator;
pub mod snapshot;

mod wire;

pub use collection::{Identity, IdentitySet, Key, StatsCollection, Template};
pub use error::{Error, Result};
pub use history::{Bucket, Counters, History};
pub use name::{Span, END_OPEN};
pub use recorder::{CombiningRewriter, RecorderConfig, RemoveUidRewriter, SnapshotRecorder};
pub use rotator::{FileRotator, Rewriter, StreamReader, StreamWriter};
pub use snapshot::{
    Entry, IgnoringObserver, NonMonotonicObserver, SetKind, Snapshot, TAG_NONE, UID_ALL,
};
