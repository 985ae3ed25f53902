pub mod project;
pub mod simulate;
pub mod validate;
