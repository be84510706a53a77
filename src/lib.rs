pub mod admin;
pub mod audit;
pub mod config;
pub mod error;
pub mod geo;
pub mod guard;
pub mod ip;
pub mod proxy;
pub mod rate_limit;
pub mod request;
pub mod retention;
pub mod routes;
pub mod server;
pub mod signals;
pub mod token;
pub mod ttl_store;
pub mod whitelist;

pub use admin::{admin_router, GuardAdmin, LogPage, ADMIN_PREFIX};
pub use audit::{AuditRecord, AuditStore, LogFilter, LogSort, LogStats, PageRequest, RecordStatus, SqliteAuditStore};
pub use config::{CliArgs, Config, GuardSettings, SharedSettings};
pub use error::{blocked_response, AuditError, GuardError, StoreError, BLOCKED_MESSAGE};
pub use geo::{CachedGeoLocator, GeoLocator, IpApiLocator, NoGeoLocator};
pub use guard::{CheckoutGuard, Decision, Outcome, SkipReason, Verdict};
pub use proxy::{AxumProxy, Proxy};
pub use rate_limit::{RateLimiter, RateStatus, DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW_DURATION};
pub use request::{BrowsingSession, ClientIdentity, RequestContext};
pub use retention::{start_retention_task, start_ttl_eviction_task, RETENTION_INTERVAL, TTL_EVICTION_INTERVAL};
pub use routes::{ProtectedRoutes, RouteKind};
pub use server::{build_router, AppState};
pub use signals::{Flag, SignalEvaluator, Signals};
pub use token::{IssuedToken, TokenManager, TOKEN_COOKIE};
pub use ttl_store::{MemoryTtlStore, TtlStore};
pub use whitelist::Whitelist;
