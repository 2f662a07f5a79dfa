//! In-process broker behind the `Connector`/`Transport` seam.
//!
//! Держит append-only лог на каждую партицию в памяти. Используется в
//! интеграционных тестах клиента и в `relay demo`. Поддерживает инъекцию
//! сбоев: отказ в подключении, задержку подтверждений, обрыв соединений.

mod broker;
mod transport;

pub use broker::LoopbackBroker;
pub use transport::LoopbackTransport;

/// Endpoint scheme accepted by [`LoopbackBroker`] as a connector.
pub const SCHEME: &str = "loopback://";
