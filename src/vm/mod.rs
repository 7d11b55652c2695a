//! cloud-hypervisor VM backend
//!
//! - `definition` - VM definition files
//! - `allocator` - vsock CID and TAP index allocation
//! - `launch` - supervisor arguments and kernel command line
//! - `process` - supervised host processes and the tmux console session
//! - `network` - TAP availability and the privileged bridge helper
//! - `api` - supervisor REST API over its Unix socket
//! - `control` - exec protocol spoken over hybrid vsock
//! - `handle` - runtime directory layout and the on-disk VM record
//! - `manager` - [`VmAdapter`], the `IsolationAdapter` tying it together

pub mod allocator;
pub mod api;
pub mod control;
pub mod definition;
pub mod handle;
pub mod launch;
pub mod manager;
pub mod network;
pub mod process;

pub use allocator::{ResourceAllocator, SharedAllocator};
pub use definition::{VirtioFsMount, VmDefinition};
pub use manager::{VmAdapter, VM};
pub use process::SupervisedProcess;
