pub mod bootstrap;
pub mod cache;
pub mod connection;
pub mod connection_factory;
pub mod deployment;
pub mod driver;
pub mod engine; // Embedded DataFusion engine
pub mod marshaller;
pub mod url_parser;

pub use bootstrap::EngineBootstrap;
pub use cache::{CacheClient, CacheClientError, CacheHandle, ClientSettings, MemoryCacheClient, RemoteCacheManager};
pub use connection::CacheConnection;
pub use connection_factory::CacheConnectionFactory;
pub use deployment::{build_descriptor, DeployOutcome, SchemaDeployer};
pub use driver::{Driver, DRIVER_NAME};
pub use engine::{EmbeddedEngine, QueryExecutionResult, SqlConnection};
pub use marshaller::{JsonMarshaller, Marshaller, MarshallerProvider, SerializationContext, WrappedMessage};
pub use url_parser::{accepts_url, parse_url, URL_PREFIX};
