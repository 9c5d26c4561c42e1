//! API collection engine: shared rate-limited clients, paged collectors and
//! the stateful and finalizable strategies built on them.

pub mod api_collector;
pub mod client;
pub mod finalizable;
pub mod iterator;
pub mod rate_limit;
pub mod raw;
pub mod retry;
pub mod stateful;
pub mod template;

pub use api_collector::{ApiCollector, ApiCollectorArgs, CollectStats, Page, Paging};
pub use client::{AfterResponse, ApiClient, ApiClientPool, ApiResponse, RequestOptions, ResponseAction};
pub use finalizable::{FinalizableApiCollector, FinalizableDetailArgs, FinalizableListArgs};
pub use iterator::{InputIterator, RawInput, RecordInput, VecInput};
pub use rate_limit::RateLimiter;
pub use raw::RawDataArgs;
pub use retry::RetryPolicy;
pub use stateful::{CollectorState, CollectorStateManager, StatefulApiCollector};
pub use template::{Pager, RequestData};
