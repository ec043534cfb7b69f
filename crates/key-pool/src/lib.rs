//! Key pool for the balance proxy
//!
//! Holds provider API keys and the state that decides which key serves the
//! next request. Three layers of truth:
//! - the persistent store (`store`): key status and per-model cooldowns
//! - the active-key cache (`cache`): short-lived per-provider snapshot
//! - the consecutive failure table (`failures`): instance-local 429 streaks
//!
//! Only the store is authoritative. Cache and counters are disposable and
//! bounded in size and age.
//!
//! Key lifecycle:
//! 1. Added through the admin API as `active`
//! 2. Selected per request, skipping keys cooling for the requested model
//! 3. 429 sets a model cooldown (conditional; never extends a running one)
//! 4. Repeated 429s escalate to a long cooldown
//! 5. 401/403 or an invalid-key 400 marks the key `blocked` until deleted

pub mod cache;
pub mod cooldown;
pub mod deferred;
pub mod error;
pub mod failures;
pub mod key;
pub mod pool;
pub mod selector;
pub mod store;

pub use cache::{ActiveKeyCache, KeyCache};
pub use cooldown::{CooldownDecision, CooldownPolicy, CooldownSource};
pub use deferred::{Deferred, DeferredTracker};
pub use error::{Error, Result};
pub use failures::{FailureCounter, FailureCounterConfig, LocalFailureCounter};
pub use key::{Key, KeyStatus, ModelCooling};
pub use pool::{DEFAULT_QUERY_LIMIT, KeyPool};
pub use selector::{select, select_at};
pub use store::{KeyPage, KeyQuery, KeyStore, MemoryKeyStore, SortBy, SortOrder, SqliteKeyStore};
