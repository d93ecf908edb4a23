pub mod config;
pub mod publish;
pub mod reassembly;
pub mod source;
pub mod state;

pub use config::{Config, PublisherConfig, ReceiverConfig, ServerConfig, SourceConfig};
pub use publish::{
    ChannelSink, MeasurementPublisher, Message, MessageSink, PublishError, StdoutSink,
    run_publisher,
};
pub use reassembly::{FragmentReceiver, Outcome, ReceiverState, run_reassembler};
pub use source::mock::MockObservationSource;
pub use source::tcp::TcpObservationSource;
pub use source::{BdAddr, Observation, ObservationSource};
pub use state::{GatewayState, GatewayStats, HealthSnapshot};
