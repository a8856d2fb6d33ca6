//! JSON-Lines IPC transport and protocol (spec §4.12, §6).

pub mod messages;
pub mod protocol;
pub mod transport;

pub use protocol::{Handler, IpcProtocol};
pub use transport::{JsonLinesReader, JsonLinesWriter};
