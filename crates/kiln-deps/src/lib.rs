pub mod lexer;
pub mod manifest;
pub mod modules;
pub mod resolver;

pub use modules::{ImportSpec, KnownModules};
pub use resolver::DependencyResolver;
