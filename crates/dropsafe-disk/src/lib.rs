#![forbid(unsafe_code)]

//! Removable-volume export pipeline.
//!
//! Integrates with the host via:
//! - `udisksctl` (status/info/unlock/mount/unmount/lock)
//! - `lsblk --json` for the block topology
//! - `sync`, `cp`, `mkdir`, `rm` for the payload and staging lifecycle
//!
//! Interactive `udisksctl` conversations run over [`PromptSession`];
//! everything non-interactive goes through [`CommandRunner`]. Both are
//! traits so the whole pipeline can be driven by scripted fakes.

mod command;
mod export;
mod exporter;
mod interact;
mod probe;
mod unlock;

pub use command::{CommandError, CommandRunner, Output, SystemRunner};
pub use export::EXPORT_DATA_DIRNAME;
pub use exporter::UsbExporter;
pub use interact::{ExpectOutcome, PipeSession, PipeSpawner, PromptSession, SessionSpawner};
pub use probe::{parse_attached_devices, parse_topology, BlockDevice};
