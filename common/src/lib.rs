pub mod point;
pub mod time;
pub mod value;

pub use point::{tag_set_key, Point, Tags};
pub use value::{FieldType, FieldValue};
