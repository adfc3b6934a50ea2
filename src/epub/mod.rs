pub mod apply;
pub mod chunk;
pub mod extract;
pub mod manifest;
pub mod package;
pub mod tree;
pub mod xml;
