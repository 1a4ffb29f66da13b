// Library interface for ptybroker
//
// `broker` holds the client handle, the server and the wire protocol between them;
// `process` answers foreground-job questions about the sessions the broker hosts.

pub mod broker;
pub mod completion;
pub mod error;
pub mod process;

pub use broker::{
    BrokerServer, Child, ChildState, ClientEvent, ConnectionState, ExitStatus, LaunchRequest,
    MultiClient, TtyConfig,
};
pub use completion::{Completion, Pending};
pub use error::{BrokerResult, ErrorKind, MultiClientError};
pub use process::{ProcessCache, ProcessInfo, ProcessSnapshot, ProcessSource, SystemProcessSource};
