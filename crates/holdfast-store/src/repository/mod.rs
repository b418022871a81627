//! # Repository Module
//!
//! Repository implementations over the store's tables.
//!
//! ```text
//! Sync Queue / Durable Cache
//!       │
//!       │  store.entries().put("cache:u1:profiles", json)
//!       ▼
//! KvRepository
//! ├── get / get_entry
//! ├── put            (quota-checked)
//! ├── remove
//! ├── scan_prefix / count_prefix / remove_prefix
//! └── usage
//!       │
//!       ▼
//! kv_entries table
//! ```
//!
//! ## Available Repositories
//!
//! - [`KvRepository`](kv::KvRepository) - Namespaced key-value rows

pub mod kv;
