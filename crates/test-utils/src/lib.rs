//! In-memory mocks for tillsync tests: a durable store, a remote document
//! store with an applied-ops ledger and scriptable failures, and a manually
//! toggled network monitor.

pub mod memory_kv;
pub mod mock_remote;
pub mod network;

pub use memory_kv::MemoryKv;
pub use mock_remote::MockRemote;
pub use network::ManualNetwork;
