// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend access: the adapter trait, the timeout-bounded gateway, an
//! in-memory adapter and the shared object layout.

pub mod gateway;
pub mod layout;
pub mod memory;
pub mod traits;

pub use gateway::BackendGateway;
pub use memory::InMemoryAdapter;
pub use traits::{AdapterError, BackendAdapter};
