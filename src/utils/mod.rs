pub mod env;
pub(crate) mod http;
pub mod sse;

#[doc(hidden)]
pub mod test_support;
