//! Provider invocation: subprocess runner, stream parsing, SDK adapters.

pub mod invoker;
pub mod sdk;
pub mod stream;

pub use invoker::{InvocationResult, OutputSink, ProviderInvoker};
pub use sdk::{AnthropicAdapter, SdkAdapter};
