//! # phonehome-transport
//!
//! HTTP plumbing and the two wire protocols.
//!
//! Build a [`TransportClient`] (the default uses [`UreqEngine`]) and hand
//! it to [`select`] to get the [`RegistrationProtocol`] named by the
//! `transport` property. [`classify`] maps status codes onto the retry
//! policy.

pub mod classify;
pub mod dts;
pub mod http;
pub mod protocol;
pub mod queue;
pub mod scrk;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use classify::{classify, status_text, Outcome};
pub use dts::DtsProtocol;
pub use http::{
    Body, Form, FormPart, HttpEngine, HttpRequest, HttpResponse, Method, ProxyConfig,
    RequestBuilder, ResponseHeaders, TransportClient, UreqEngine,
};
pub use protocol::{select, Registration, RegistrationProtocol, SendReceipt};
pub use queue::QueueResponse;
pub use scrk::ScrkProtocol;
