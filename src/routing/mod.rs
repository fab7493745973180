pub mod matcher;

pub use matcher::{CompiledRoute, PathPattern, RouteMatch, Router};
