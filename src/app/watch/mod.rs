pub mod matcher;
pub mod registry;
pub mod tail;
pub mod watcher;

pub use matcher::Matcher;
pub use registry::{PatternRegistry, WatchHandle, WatchId};
pub use tail::{LogTail, TailCloser};
pub use watcher::{LogWatcher, SlotGuard, WaitOptions, WatchSlot, WatcherState};
