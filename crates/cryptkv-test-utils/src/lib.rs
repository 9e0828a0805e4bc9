//! In-process fakes of the HTTP key/value agents cryptkv talks to, for unit
//! and integration tests. Each fake binds an ephemeral localhost port and
//! answers one request per connection.

mod http;

pub mod consul;
pub mod etcd;

pub use consul::FakeConsul;
pub use etcd::FakeEtcd;
