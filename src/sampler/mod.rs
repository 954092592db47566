// Batch sampler module
//
// Reads a voltage source at a fixed rate, writes fixed-size batches as CSV
// files and announces each one on the upload channel.

pub mod batch;
pub mod producer;
pub mod source;

pub use batch::{last_batch_number, pending_batches, valid_source_id, BatchFileName, Sample};
pub use producer::{pacing_delay, BatchProducer, ProducedBatch};
pub use source::{open_source, IioVoltageSource, SimulatedVoltageSource, VoltageSource};
