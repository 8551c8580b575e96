// shoal-test-utils: shared test doubles for the transport suite.
//
// `MockWire` scripts engine-level exchanges in memory (no sockets), so unit
// tests can drive the pipeline deterministically, including under a paused
// tokio clock. `MockNode` binds a real TCP listener speaking just enough
// HTTP/1.1 to exercise the stock reqwest engine end to end.

mod mock_node;
mod mock_wire;

pub use mock_node::{HttpRequest, HttpResponse, MockNode};
pub use mock_wire::{MockExchange, MockFleet, MockReply, MockWire, RecordedCall};
