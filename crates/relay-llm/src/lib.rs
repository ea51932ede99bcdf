pub mod client;
pub mod reliable;
pub mod sse;

pub mod mock;

pub use client::{ClientConfig, OpenAiCompatProvider};
pub use mock::{MockProvider, MockResponse};
pub use reliable::{ReliableConfig, ReliableProvider};
