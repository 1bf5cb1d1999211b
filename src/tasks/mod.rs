pub mod label;
pub mod train;

pub use label::run_label;
pub use train::{
    scheduled_lr, select_device, JsonlSink, LrSchedule, MetricsSink, StepMetrics, TracingSink,
    Trainer, CONFIG_FILE,
};
