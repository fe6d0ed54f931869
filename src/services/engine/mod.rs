// Embedded query engine
//
// Deployed schemas are served by Apache DataFusion. Tables come from protobuf
// schema resources stored in the cache and are scanned straight from the
// cache's entries.

pub mod catalog;
pub mod converter;
pub mod embedded;
pub mod executor;
pub mod local_cache;
pub mod protobuf;
pub mod session;
pub mod table;
pub mod translator;

pub use converter::ResultConverter;
pub use embedded::{DeployedSchema, DeploymentError, EmbeddedEngine, PLAN_CACHE_NAME};
pub use executor::{QueryExecutionResult, SqlConnection};
pub use local_cache::{CacheStats, LocalCache, LocalCacheFactory};
pub use session::EngineSessionFactory;
pub use table::CacheTable;
pub use translator::{CacheTranslator, Translator, TranslatorError, CACHE_TRANSLATOR_NAME};
