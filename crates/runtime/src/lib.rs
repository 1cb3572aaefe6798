//! Production implementation of the Runtime trait.

mod prod;

pub use prod::ProdRuntime;
