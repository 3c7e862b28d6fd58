//! Sender Policy Framework (RFC 7208) policy evaluation.
//!
//! [`check_host`] takes the classic triple of client IP, MAIL FROM or
//! HELO domain, and sender identity, fetches the domain's policy over
//! DNS, and returns one authoritative [`SpfResult`], optionally with the
//! policy's `exp=` explanation text.
//!
//! DNS is pluggable through the [`dns::Resolver`] trait: a
//! hickory-resolver transport ships for live use, an in-memory
//! [`dns::MockResolver`] for tests, and [`dns::LimitedResolver`] arms the
//! RFC 7208 Section 4.6.4 lookup budgets around any driver. Caching is
//! the resolver's concern, not the engine's; persisted answers travel in
//! the [`dns::CacheDump`] format.
//!
//! ```no_run
//! use spf_check::{check_host, SpfResult};
//!
//! # async fn demo() {
//! let eval = check_host(
//!     "192.0.2.10".parse().unwrap(),
//!     "example.com",
//!     "user@example.com",
//! )
//! .await;
//! if eval.result == SpfResult::Fail {
//!     // reject, quoting eval.explanation
//! }
//! # }
//! ```

pub mod dns;
pub mod error;
pub mod eval;
pub mod filter;
pub mod fqdn;
pub mod lexer;
pub mod listener;
pub mod macros;
pub mod result;
pub mod token;
pub mod trace;

pub use dns::Resolver;
pub use error::{ErrorKind, SpfError};
pub use eval::{
    check_host, Evaluation, Verifier, DEFAULT_LOOKUP_LIMIT, DEFAULT_MX_QUERIES_LIMIT,
    DEFAULT_VOID_LOOKUP_LIMIT,
};
pub use listener::{Listener, NoopListener, TraceListener};
pub use result::SpfResult;
pub use token::{Qualifier, TermKind, Token};
pub use trace::Trace;
