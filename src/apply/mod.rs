pub mod ddl;
pub mod dml;
pub mod value;

pub use ddl::DdlApplier;
pub use dml::DmlApplier;
pub use value::{convert_value, SqlValue};
