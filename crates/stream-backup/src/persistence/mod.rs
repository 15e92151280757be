pub mod backup_sink;
pub mod object_store;
pub mod sequencer;

pub use backup_sink::{BackupSink, SinkReport};
pub use object_store::{Encryption, ObjectStore, PutOptions, VersionPage, VersionPageToken};
pub use sequencer::{group_by_keys, KeyGroup};
