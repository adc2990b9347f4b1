//! Multi-account Google OAuth credential management: on-disk records,
//! a rotating pool with refresh-before-lease, and the token endpoint seam.

pub mod pool;
pub mod record;
pub mod refresh;
pub mod store;

pub use pool::{AccountPool, Lease, LeaseOutcome, PoolError};
pub use record::AccountRecord;
pub use refresh::{HttpTokenRefresher, RefreshError, RefreshedToken, TokenRefresher};
pub use store::{Account, StoreError};
