pub mod defer;
pub mod fs;
