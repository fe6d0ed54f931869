pub mod descriptor;
pub mod document;
pub mod metadata;
pub mod properties;
pub mod query;

pub use descriptor::*;
pub use document::*;
pub use metadata::*;
pub use properties::*;
pub use query::*;
