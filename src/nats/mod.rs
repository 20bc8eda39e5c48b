/// NATS JetStream integration module
///
/// Credentials, sessions, stream/consumer provisioning, envelope decoding and
/// the poll-forward loop that drives a live stream.

pub mod credentials;
pub mod session;
pub mod provision;
pub mod envelope;
pub mod poll;

pub use credentials::{CredentialError, CredentialStorage, MaterializedCredentials};
pub use session::Session;
pub use provision::{ConsumerSpec, DeliveryPolicy, ProvisionedConsumer, StreamTopic};
pub use envelope::{EnvelopeError, Frame, OutputRecord};
pub use poll::{
    Delivery, ForwardError, JetStreamSource, LoopExit, LoopStats, MessageSource,
    PollForwardLoop, PullError, RecordSink,
};
