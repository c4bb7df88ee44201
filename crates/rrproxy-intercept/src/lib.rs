pub mod egress;
pub mod error;
pub mod event_router;
pub mod hook;
pub mod ingress;
pub mod parsers;

pub use egress::{EgressInterceptor, ParserRegistry};
pub use error::InterceptError;
pub use hook::HookRedirector;
pub use ingress::IngressInterceptor;
pub use parsers::Parser;
