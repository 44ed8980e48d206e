pub mod assistant;
pub mod imagine;
pub mod notifier;
pub mod pipeline;
pub mod task;
pub mod transform;
