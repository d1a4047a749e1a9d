//! Rate limiting logic and state management.

mod admission;
mod bucket;
mod cache;
mod key;

pub use admission::{Admission, AdmissionControl};
pub use bucket::{Quota, TokenBucket};
pub use cache::{LimiterCache, DEFAULT_SHARDS};
pub use key::{split_host_port, ClientKey, KeyResolver, DEFAULT_IP_HEADER};
