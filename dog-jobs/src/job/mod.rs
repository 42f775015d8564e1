pub mod registry;

pub use registry::{HandlerRegistry, JobHandler, Dispatched};
