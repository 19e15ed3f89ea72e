//! Endpoint integration tests.
//!
//! Every test builds its own [`InMemoryBroker`](shared_broker::InMemoryBroker)
//! so tests never share destinations.

pub mod consumers;
pub mod request_reply;

use mq_endpoint::{BrokerTransport, Endpoint, EndpointConfig};
use shared_broker::InMemoryBroker;
use std::sync::Arc;

/// Fresh broker plus a transport over it.
pub fn broker() -> (Arc<InMemoryBroker>, Arc<BrokerTransport>) {
    let broker = Arc::new(InMemoryBroker::new());
    let transport = Arc::new(BrokerTransport::new(broker.clone()));
    (broker, transport)
}

/// Started endpoint on the queue `name`.
pub fn endpoint(transport: &Arc<BrokerTransport>, name: &str, config: EndpointConfig) -> Endpoint {
    let endpoint = Endpoint::builder(transport.clone())
        .destination_name(name)
        .config(config)
        .build()
        .expect("valid endpoint config");
    endpoint.start().expect("destination resolves");
    endpoint
}
