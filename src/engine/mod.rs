pub mod dispatcher;
pub mod lifecycle;
pub mod matcher;
pub mod pricing;
pub mod queue;
pub mod scoring;
