pub mod export;
pub mod ldif;
pub mod policy;
pub mod sink;

pub use export::{ExportSummary, LdifExporter, LdifImporter};
pub use ldif::{LdifReader, LdifWriter};
pub use policy::SelectionPolicy;
pub use sink::{ExportDestination, SinkSummary, TransformSink, TransformSinkBuilder};
