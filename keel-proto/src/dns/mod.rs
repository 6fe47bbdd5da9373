//! DNS over the keel event loop.
//!
//! - Wire codec for queries and responses (`codec`)
//! - Hosts file lookup (`hosts`)
//! - Asynchronous resolver with retry and timeout (`resolver`)

pub mod codec;
pub mod hosts;
pub mod resolver;

pub use codec::{DnsError, DnsMessage, Question, RecordData, RecordType, ResourceRecord, MAX_RECORDS};
pub use hosts::{lookup_hosts, resolve_from_hosts_file};
pub use resolver::{connect_host, resolve_async, DnsResolver, ResolveError, ResolveOpts, ResolverLayer};
