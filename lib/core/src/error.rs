//! Error handling primitives.
//!
//! Crates define their own error enums and surface them wrapped in a
//! rootcause `Report`, attaching context as the error crosses layers.

use rootcause::Report;

/// Result alias carrying a rootcause report.
///
/// `C` is the context type at the top of the report; callers that only
/// care about success or failure can leave it as `()`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
