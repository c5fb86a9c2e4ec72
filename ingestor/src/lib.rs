pub mod app;
pub mod control;
pub mod endpoint;
pub mod mapper;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod store;

pub use app::{App, StartRequest};
