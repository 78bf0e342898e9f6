//! fail-ding: watches a host application's outbound AI generation calls and
//! plays an alert when a round fails or comes back empty.
//!
//! The host calls [`Monitor::intercept`] on its payload right before sending a
//! generation request, and sends its calls through a [`WatchedClient`] (single
//! request/response calls) or a [`WatchedCall`] (event-driven calls).

pub mod arming;
pub mod audio;
pub mod classifier;
pub mod client;
pub mod config;
pub mod event;
pub mod event_call;
pub mod hotkey;
pub mod logging;
pub mod monitor;
pub mod notifier;
pub mod paths;
pub mod round;

pub use classifier::Classifier;
pub use client::{HttpRequest, HttpResponse, ReqwestTransport, ResponseBody, Transport, WatchedClient};
pub use event_call::{CallEvent, EventCall, WatchedCall};
pub use monitor::{Monitor, MonitorSettings, RoundHandle, Surface};
pub use round::RoundOutcome;
